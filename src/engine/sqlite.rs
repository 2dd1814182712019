//! SQLite engine backed by `rusqlite`.
//!
//! The database lives in a file inside a private temporary directory, so an
//! image can be restored by writing its bytes and exported with
//! `VACUUM INTO`. The directory is removed when the engine is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Batch, Connection, Statement};
use serde_json::{Number, Value};
use tempfile::TempDir;

use super::{Engine, EngineError, EngineResult};
use crate::worker::protocol::{FlatRow, Params, ResultTable};

const IMAGE_FILE: &str = "database.sqlite3";

/// Prefixes SQLite accepts for named parameters.
const NAMED_PREFIXES: [char; 3] = [':', '$', '@'];

/// SQLite database held by the worker.
pub struct SqliteEngine {
    conn: Option<Connection>,
    dir: TempDir,
}

impl SqliteEngine {
    /// Create an engine with no open database.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("sqlbridge-").tempdir()?;
        Ok(Self { conn: None, dir })
    }

    fn image_path(&self) -> PathBuf {
        self.dir.path().join(IMAGE_FILE)
    }

    fn conn(&self) -> EngineResult<&Connection> {
        self.conn.as_ref().ok_or(EngineError::NotOpen)
    }
}

impl Engine for SqliteEngine {
    fn open(&mut self, image: Option<&[u8]>) -> EngineResult<()> {
        self.close()?;

        let path = self.image_path();
        remove_database_files(&path)?;
        if let Some(bytes) = image {
            fs::write(&path, bytes)?;
        }

        let conn = Connection::open(&path)?;
        // Corrupt images only fail once a page is read.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;

        tracing::debug!(restored = image.is_some(), "sqlite database opened");
        self.conn = Some(conn);
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: Option<&Params>) -> EngineResult<Vec<ResultTable>> {
        let conn = self.conn()?;
        let mut results: Vec<ResultTable> = Vec::new();
        let mut current = None;

        for_each_row(conn, sql, params, |statement, columns, values| {
            if current != Some(statement) {
                results.push(ResultTable {
                    columns: columns.to_vec(),
                    values: Vec::new(),
                });
                current = Some(statement);
            }
            if let Some(table) = results.last_mut() {
                table.values.push(values);
            }
        })?;

        Ok(results)
    }

    fn each(
        &mut self,
        sql: &str,
        params: Option<&Params>,
        emit_row: &mut dyn FnMut(FlatRow),
    ) -> EngineResult<()> {
        let conn = self.conn()?;
        for_each_row(conn, sql, params, |_, columns, values| {
            emit_row(columns.iter().cloned().zip(values).collect());
        })
    }

    fn export(&mut self) -> EngineResult<Vec<u8>> {
        let conn = self.conn()?;
        let target = self
            .dir
            .path()
            .join(format!("export-{}.sqlite3", uuid::Uuid::new_v4()));

        conn.execute("VACUUM INTO ?1", [target.to_string_lossy().into_owned()])?;
        let bytes = fs::read(&target);
        let _ = fs::remove_file(&target);
        Ok(bytes?)
    }

    fn close(&mut self) -> EngineResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| e)?;
            tracing::debug!("sqlite database closed");
        }
        Ok(())
    }
}

/// Run every statement in `sql`, calling `on_row(statement_index, columns, values)`
/// for each row produced.
fn for_each_row<F>(
    conn: &Connection,
    sql: &str,
    params: Option<&Params>,
    mut on_row: F,
) -> EngineResult<()>
where
    F: FnMut(usize, &[String], Vec<Value>),
{
    let mut batch = Batch::new(conn, sql);
    let mut index = 0;

    while let Some(mut statement) = batch.next()? {
        if let Some(params) = params {
            bind(&mut statement, params)?;
        }

        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = statement.raw_query();
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(to_json))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            on_row(index, &columns, values);
        }
        index += 1;
    }

    Ok(())
}

/// Bind parameters to one statement. Parameters the statement does not
/// declare are ignored, so one parameter set can serve a multi-statement
/// script.
fn bind(statement: &mut Statement<'_>, params: &Params) -> EngineResult<()> {
    match params {
        Params::Positional(values) => {
            let count = statement.parameter_count();
            for (i, value) in values.iter().enumerate().take(count) {
                statement.raw_bind_parameter(i + 1, to_sql(value))?;
            }
        }
        Params::Named(values) => {
            for (name, value) in values {
                if let Some(index) = parameter_index(statement, name)? {
                    statement.raw_bind_parameter(index, to_sql(value))?;
                }
            }
        }
    }
    Ok(())
}

fn parameter_index(statement: &Statement<'_>, name: &str) -> EngineResult<Option<usize>> {
    if name.starts_with(NAMED_PREFIXES) {
        return Ok(statement.parameter_index(name)?);
    }
    for prefix in NAMED_PREFIXES {
        if let Some(index) = statement.parameter_index(&format!("{}{}", prefix, name))? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(items) => match items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
        {
            Some(bytes) => SqlValue::Blob(bytes),
            None => SqlValue::Text(value.to_string()),
        },
        Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn remove_database_files(path: &Path) -> io::Result<()> {
    let journal = PathBuf::from(format!("{}-journal", path.display()));
    for file in [path, journal.as_path()] {
        match fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
