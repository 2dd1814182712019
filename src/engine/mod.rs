//! Worker-side command execution.
//!
//! The [`Worker`] turns each [`Command`] into the responses the bridge
//! expects, delegating the actual SQL work to an [`Engine`]:
//!
//! ```text
//! open   -> { id, ready: true }            | { id, error }
//! exec   -> { id, results: [...] }         | { id, error }
//! each   -> { id, row, finished: false }*  then { id, finished: true } | { id, error }
//! export -> { id, buffer }                 | { id, error }
//! close  -> { id }                         | { id, error }
//! ```
//!
//! [`serve`] runs the same loop over NDJSON, which is how the process
//! transport talks to `sqlbridge worker`.

mod sqlite;

pub use sqlite::SqliteEngine;

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::worker::protocol::{recover_id, Action, Command, FlatRow, Params, Response, ResultTable};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by an engine. Their text is sent to the caller verbatim.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database is not open")]
    NotOpen,

    #[error("{0} requires sql")]
    MissingSql(&'static str),

    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// An embedded SQL engine living inside the worker context.
pub trait Engine {
    /// Open a database, restoring `image` if given, or starting empty.
    fn open(&mut self, image: Option<&[u8]>) -> EngineResult<()>;

    /// Run every statement in `sql`, collecting one table per statement
    /// that produced rows.
    fn execute(&mut self, sql: &str, params: Option<&Params>) -> EngineResult<Vec<ResultTable>>;

    /// Run `sql`, handing each row to `emit_row` as soon as it is read.
    fn each(
        &mut self,
        sql: &str,
        params: Option<&Params>,
        emit_row: &mut dyn FnMut(FlatRow),
    ) -> EngineResult<()>;

    /// Serialize the current database image.
    fn export(&mut self) -> EngineResult<Vec<u8>>;

    /// Close the database.
    fn close(&mut self) -> EngineResult<()>;
}

/// Maps commands to responses for one engine.
pub struct Worker<E> {
    engine: E,
}

impl<E: Engine> Worker<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    /// Execute one command, emitting its response(s) in order.
    pub fn handle(&mut self, command: Command, emit: &mut dyn FnMut(Response)) {
        let Command {
            id,
            action,
            sql,
            params,
            buffer,
        } = command;

        tracing::trace!(%id, action = action.as_str(), "handling command");

        match action {
            Action::Open => match self.engine.open(buffer.as_deref()) {
                Ok(()) => emit(Response::ready(id)),
                Err(e) => emit(Response::error(id, e.to_string())),
            },
            Action::Exec => {
                let result = sql
                    .ok_or(EngineError::MissingSql("exec"))
                    .and_then(|sql| self.engine.execute(&sql, params.as_ref()));
                match result {
                    Ok(results) => emit(Response::results(id, results)),
                    Err(e) => emit(Response::error(id, e.to_string())),
                }
            }
            Action::Each => {
                let result = match sql {
                    Some(sql) => self.engine.each(&sql, params.as_ref(), &mut |row| {
                        emit(Response::row(id.as_str(), row))
                    }),
                    None => Err(EngineError::MissingSql("each")),
                };
                match result {
                    Ok(()) => emit(Response::done(id)),
                    Err(e) => emit(Response::error(id, e.to_string())),
                }
            }
            Action::Export => match self.engine.export() {
                Ok(buffer) => emit(Response::buffer(id, buffer)),
                Err(e) => emit(Response::error(id, e.to_string())),
            },
            Action::Close => match self.engine.close() {
                Ok(()) => emit(Response::ack(id)),
                Err(e) => emit(Response::error(id, e.to_string())),
            },
        }
    }
}

/// Serve the NDJSON protocol: one command per input line, one response per
/// output line. Returns when the input ends.
///
/// A line that is not a valid command is answered with an error if an `id`
/// can be recovered from it, and skipped otherwise.
pub fn serve<E, R, W>(engine: E, input: R, mut output: W) -> io::Result<()>
where
    E: Engine,
    R: BufRead,
    W: Write,
{
    let mut worker = Worker::new(engine);

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut write_error = None;
        let mut emit = |response: Response| {
            if write_error.is_none() {
                if let Err(e) = write_response(&mut output, &response) {
                    write_error = Some(e);
                }
            }
        };

        match serde_json::from_str::<Command>(&line) {
            Ok(command) => worker.handle(command, &mut emit),
            Err(e) => match recover_id(&line) {
                Some(id) => emit(Response::error(id, format!("invalid command: {}", e))),
                None => tracing::warn!(error = %e, "skipping malformed command"),
            },
        }

        if let Some(e) = write_error {
            return Err(e);
        }
        output.flush()?;
    }

    Ok(())
}

/// Serve the NDJSON protocol on this process's stdin/stdout.
pub fn serve_stdio<E: Engine>(engine: E) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(engine, stdin.lock(), io::BufWriter::new(stdout.lock()))
}

fn write_response<W: Write>(output: &mut W, response: &Response) -> io::Result<()> {
    serde_json::to_writer(&mut *output, response)?;
    output.write_all(b"\n")
}
