//! Channels to the worker context.
//!
//! The bridge only needs two things from a transport: a way to post a
//! [`Command`] and a stream of [`Response`]s. Two transports are provided:
//!
//! - [`WorkerChannel::thread`]: the engine runs on a dedicated OS thread and
//!   messages move over in-process queues.
//! - [`WorkerChannel::process`]: the engine runs in a child process
//!   (`sqlbridge worker`) speaking NDJSON over stdin/stdout.
//!
//! [`WorkerChannel::ndjson`] speaks the same NDJSON over any byte streams.
//! A line that cannot be decoded is still routed by its `id`, so the caller
//! waiting on it fails with [`ChannelError::Decode`] instead of timing out.
//!
//! Whatever the transport, responses for one id must arrive in the order the
//! worker sent them. Responses for different ids may interleave freely.

use std::path::Path;
use std::thread;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::error::ChannelError;
use super::protocol::{recover_id, Command, Response};
use crate::engine::{Engine, Worker};

/// Sending half of a transport.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Post a command to the worker. Does not wait for a response.
    async fn post(&self, command: &Command) -> Result<(), ChannelError>;
}

#[async_trait]
impl Outbound for mpsc::UnboundedSender<Command> {
    async fn post(&self, command: &Command) -> Result<(), ChannelError> {
        self.send(command.clone()).map_err(|_| ChannelError::Send)
    }
}

/// NDJSON command writer, e.g. over a child's stdin.
struct NdjsonWriter<W> {
    output: Mutex<BufWriter<W>>,
}

#[async_trait]
impl<W> Outbound for NdjsonWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn post(&self, command: &Command) -> Result<(), ChannelError> {
        let line = serde_json::to_string(command).map_err(ChannelError::Encode)? + "\n";
        let mut output = self.output.lock().await;
        output
            .write_all(line.as_bytes())
            .await
            .map_err(ChannelError::Write)?;
        output.flush().await.map_err(ChannelError::Write)
    }
}

/// A worker message that could not be decoded.
#[derive(Debug)]
pub struct Undecodable {
    /// The `id` field, if the message was JSON and carried one.
    pub id: Option<String>,
    pub error: ChannelError,
}

/// One inbound message as the bridge's dispatcher sees it.
pub type Inbound = Result<Response, Undecodable>;

/// Where a worker posts its responses.
#[derive(Clone)]
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ResponseSender {
    pub fn send(&self, response: Response) -> Result<(), ChannelError> {
        self.tx.send(Ok(response)).map_err(|_| ChannelError::Send)
    }

    /// Report a message that could not be decoded.
    pub fn reject(&self, undecodable: Undecodable) -> Result<(), ChannelError> {
        self.tx.send(Err(undecodable)).map_err(|_| ChannelError::Send)
    }
}

/// What keeps the worker context alive.
pub enum WorkerHandle {
    /// Worker lifetime is managed by the caller.
    Detached,
    /// Dedicated engine thread. Exits once the command queue is dropped.
    Thread(thread::JoinHandle<()>),
    /// NDJSON streams plus the task decoding them.
    Reader(JoinHandle<()>),
    /// Child process plus the task decoding its stdout.
    Process {
        child: Child,
        reader: JoinHandle<()>,
    },
}

impl WorkerHandle {
    /// Whether the worker context still appears to be running.
    pub fn is_running(&self) -> bool {
        match self {
            WorkerHandle::Detached => true,
            WorkerHandle::Thread(handle) => !handle.is_finished(),
            WorkerHandle::Reader(reader) => !reader.is_finished(),
            WorkerHandle::Process { child, reader } => {
                child.id().is_some() && !reader.is_finished()
            }
        }
    }
}

/// A bidirectional message channel to one worker.
pub struct WorkerChannel {
    pub(crate) outbound: Box<dyn Outbound>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Inbound>,
    pub(crate) handle: WorkerHandle,
}

/// The worker's side of an in-process channel.
pub struct WorkerEnd {
    /// Commands posted by the bridge.
    pub commands: mpsc::UnboundedReceiver<Command>,
    /// Where the worker posts its responses.
    pub responses: ResponseSender,
}

impl WorkerChannel {
    /// Build a channel from raw parts.
    pub fn from_parts(
        outbound: Box<dyn Outbound>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            handle: WorkerHandle::Detached,
        }
    }

    /// Create an in-process channel and hand back the worker's end.
    ///
    /// Useful for driving a custom worker, or a scripted one in tests.
    pub fn pair() -> (Self, WorkerEnd) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let channel = Self::from_parts(Box::new(command_tx), response_rx);
        let end = WorkerEnd {
            commands: command_rx,
            responses: ResponseSender { tx: response_tx },
        };
        (channel, end)
    }

    /// Run `engine` on a dedicated thread.
    pub fn thread<E>(engine: E) -> Result<Self, ChannelError>
    where
        E: Engine + Send + 'static,
    {
        let (mut channel, mut end) = Self::pair();

        let handle = thread::Builder::new()
            .name("sqlbridge-worker".to_string())
            .spawn(move || {
                let mut worker = Worker::new(engine);
                while let Some(command) = end.commands.blocking_recv() {
                    worker.handle(command, &mut |response| {
                        // The bridge is gone; nothing left to answer.
                        let _ = end.responses.send(response);
                    });
                }
                tracing::debug!("worker thread exiting");
            })
            .map_err(ChannelError::Spawn)?;

        channel.handle = WorkerHandle::Thread(handle);
        Ok(channel)
    }

    /// Spawn a worker process that serves the NDJSON protocol on stdio.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn process<P: AsRef<Path>>(
        worker_path: P,
        args: &[String],
    ) -> Result<Self, ChannelError> {
        let mut child = tokio::process::Command::new(worker_path.as_ref())
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ChannelError::Spawn)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ChannelError::Spawn(std::io::Error::other("worker stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ChannelError::Spawn(std::io::Error::other("worker stdout not captured"))
        })?;

        let (outbound, inbound, reader) = ndjson_parts(stdin, stdout);

        tracing::debug!(path = %worker_path.as_ref().display(), "spawned worker process");

        Ok(Self {
            outbound,
            inbound,
            handle: WorkerHandle::Process { child, reader },
        })
    }

    /// Speak NDJSON to a worker over a pair of byte streams.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn ndjson<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (outbound, inbound, reader) = ndjson_parts(writer, reader);
        Self {
            outbound,
            inbound,
            handle: WorkerHandle::Reader(reader),
        }
    }
}

fn ndjson_parts<W, R>(
    writer: W,
    reader: R,
) -> (Box<dyn Outbound>, mpsc::UnboundedReceiver<Inbound>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let task = spawn_reader_task(reader, ResponseSender { tx: response_tx });
    let outbound: Box<dyn Outbound> = Box::new(NdjsonWriter {
        output: Mutex::new(BufWriter::new(writer)),
    });
    (outbound, response_rx, task)
}

/// Decode one NDJSON line from the worker.
fn decode_line(line: &str) -> Inbound {
    serde_json::from_str::<Response>(line).map_err(|e| Undecodable {
        id: recover_id(line),
        error: ChannelError::Decode(e),
    })
}

/// Decode NDJSON responses from the worker's output.
fn spawn_reader_task<R>(output: R, responses: ResponseSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(output);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let sent = match decode_line(&line) {
                        Ok(response) => responses.send(response),
                        Err(undecodable) => responses.reject(undecodable),
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %ChannelError::Read(e), "worker output closed");
                    break;
                }
            }
        }
    })
}
