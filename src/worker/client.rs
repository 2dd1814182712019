//! Async bridge to the worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use super::error::{BridgeError, BridgeResult, ChannelError, ConsumerFailure, ProtocolError};
use super::protocol::{Action, Command, Event, FlatRow, Params, Response, ResultTable};
use super::transport::{Inbound, Outbound, Undecodable, WorkerChannel, WorkerHandle};
use crate::config::{Transport, WorkerSettings};
use crate::engine::{Engine, SqliteEngine};

/// Default timeout for requests (30 seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A response, or the reason the message under its id could not be read.
type Delivery = Result<Response, ChannelError>;

/// Who is waiting for responses under one id.
enum Waiter {
    /// Single request, single response.
    Once(oneshot::Sender<Delivery>),
    /// `each` stream: every chunk until the terminal one.
    Stream(mpsc::UnboundedSender<Delivery>),
}

/// Correlation id -> waiter.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<String, Waiter>>,
    discarded: AtomicU64,
}

impl PendingTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: &str, waiter: Waiter) -> Result<(), ProtocolError> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(ProtocolError::DuplicateId(id.to_string()));
        }
        entries.insert(id.to_string(), waiter);
        Ok(())
    }

    fn remove(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Route one inbound message to its waiter.
    ///
    /// The entry is removed before delivery. A stream entry is put back under
    /// the same id unless the response ends the stream; both steps happen
    /// under one lock, so no chunk can slip in between. A message that could
    /// not be decoded ends its waiter with the decode error.
    fn dispatch(&self, inbound: Inbound) {
        let (id, delivery) = match inbound {
            Ok(response) => (response.id.clone(), Ok(response)),
            Err(Undecodable { id: Some(id), error }) => (id, Err(error)),
            Err(Undecodable { id: None, error }) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %error, "discarding undecodable worker output");
                return;
            }
        };

        let mut entries = self.entries();

        let Some(waiter) = entries.remove(&id) else {
            drop(entries);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %ProtocolError::UnknownId(id), "discarding response");
            return;
        };

        match waiter {
            Waiter::Once(tx) => {
                // Receiver gone means the caller timed out; nothing to do.
                let _ = tx.send(delivery);
            }
            Waiter::Stream(tx) => {
                let ends = delivery.as_ref().map_or(true, Response::ends_stream);
                if tx.send(delivery).is_ok() && !ends {
                    entries.insert(id, Waiter::Stream(tx));
                }
            }
        }
    }

    /// Reject every outstanding waiter by dropping it.
    fn drain(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Removes its table entry when dropped, whatever the exit path.
struct PendingGuard {
    table: Arc<PendingTable>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Lifecycle of the database behind the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    /// No `open` has completed yet.
    Idle,
    /// The worker confirmed the database is ready.
    Open,
    /// The last `open` failed; only another `open` is accepted.
    Failed(String),
    /// `close` completed; nothing is accepted.
    Closed,
}

/// Async command/response bridge to a database worker.
///
/// Every command gets a fresh correlation id and a waiter in the pending
/// table before it is posted. A background dispatcher task routes each
/// inbound response to the waiter registered under its id, so any number of
/// commands may be in flight at once and their responses may arrive in any
/// order.
///
/// # Example
///
/// ```ignore
/// use sqlbridge::worker::Bridge;
///
/// let bridge = Bridge::spawn_thread(SqliteEngine::new()?)?;
/// bridge.open(None).await?;
/// let tables = bridge.execute("SELECT 1 AS One", None).await?;
/// bridge.close().await?;
/// ```
pub struct Bridge {
    /// Posting side of the channel; `None` once closed.
    outbound: RwLock<Option<Box<dyn Outbound>>>,

    /// Map of pending request ids to waiters.
    pending: Arc<PendingTable>,

    state: Mutex<BridgeState>,

    /// Handle to the background dispatcher task.
    dispatcher: JoinHandle<()>,

    /// Keeps the worker context alive.
    worker: WorkerHandle,

    /// Request timeout duration.
    timeout: Duration,
}

impl Bridge {
    /// Create a bridge over an existing channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(channel: WorkerChannel) -> Self {
        Self::with_timeout(channel, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a bridge with a custom request timeout.
    pub fn with_timeout(channel: WorkerChannel, timeout: Duration) -> Self {
        let WorkerChannel {
            outbound,
            inbound,
            handle,
        } = channel;

        let pending = Arc::new(PendingTable::default());
        let dispatcher = Self::spawn_dispatcher(inbound, pending.clone());

        Self {
            outbound: RwLock::new(Some(outbound)),
            pending,
            state: Mutex::new(BridgeState::Idle),
            dispatcher,
            worker: handle,
            timeout,
        }
    }

    /// Run `engine` on a dedicated worker thread.
    pub fn spawn_thread<E>(engine: E) -> BridgeResult<Self>
    where
        E: Engine + Send + 'static,
    {
        Ok(Self::new(WorkerChannel::thread(engine)?))
    }

    /// Spawn a worker process serving the NDJSON protocol on stdio.
    pub async fn spawn_process<P: AsRef<Path>>(worker_path: P, args: &[String]) -> BridgeResult<Self> {
        Ok(Self::new(WorkerChannel::process(worker_path, args).await?))
    }

    /// Spawn a worker as described by the settings.
    pub async fn spawn_with_settings(settings: &WorkerSettings) -> BridgeResult<Self> {
        let channel = match settings.transport {
            Transport::Thread => {
                let engine = SqliteEngine::new().map_err(ChannelError::Spawn)?;
                WorkerChannel::thread(engine)?
            }
            Transport::Process => {
                let path = settings.worker_path().map_err(|e| {
                    ChannelError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        e.to_string(),
                    ))
                })?;
                WorkerChannel::process(path, &["worker".to_string()]).await?
            }
        };

        Ok(Self::with_timeout(channel, settings.request_timeout()))
    }

    /// Spawn the background task that routes responses to waiters.
    fn spawn_dispatcher(
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        pending: Arc<PendingTable>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pending.dispatch(message);
            }

            // Worker exited - every remaining waiter sees a closed channel.
            let rejected = pending.drain();
            if rejected > 0 {
                tracing::warn!(rejected, "worker exited with requests in flight");
            } else {
                tracing::debug!("worker channel closed");
            }
        })
    }

    fn state_guard(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state_guard();
        if *state != BridgeState::Closed {
            *state = next;
        }
    }

    fn check_usable(&self, action: Action) -> BridgeResult<()> {
        match &*self.state_guard() {
            BridgeState::Closed => Err(BridgeError::Closed),
            BridgeState::Failed(reason) if action != Action::Open => {
                Err(BridgeError::Unavailable(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    /// The error a waiter sees when its sender was dropped.
    fn disconnected(&self) -> BridgeError {
        if *self.state_guard() == BridgeState::Closed {
            BridgeError::Closed
        } else {
            ChannelError::Disconnected.into()
        }
    }

    fn register(&self, id: &str, waiter: Waiter) -> BridgeResult<PendingGuard> {
        self.pending.insert(id, waiter)?;
        Ok(PendingGuard {
            table: self.pending.clone(),
            id: id.to_string(),
        })
    }

    async fn post(&self, command: &Command) -> BridgeResult<()> {
        let outbound = self.outbound.read().await;
        let outbound = outbound.as_ref().ok_or(BridgeError::Closed)?;

        tracing::trace!(id = %command.id, action = command.action.as_str(), "posting command");
        outbound.post(command).await?;
        Ok(())
    }

    /// Send a single-response command and wait for its response.
    async fn request(&self, command: Command) -> BridgeResult<Event> {
        self.check_usable(command.action)?;

        // Register before posting so a fast response always finds its entry.
        let (tx, rx) = oneshot::channel();
        let _guard = self.register(&command.id, Waiter::Once(tx))?;

        self.post(&command).await?;

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(delivery)) => delivery?,
            Ok(Err(_)) => return Err(self.disconnected()),
            Err(_) => return Err(BridgeError::Timeout(self.timeout)),
        };

        match response.into_event() {
            Event::Error(message) => Err(BridgeError::Engine(message)),
            event => Ok(event),
        }
    }

    /// Open the database, optionally restoring an existing image.
    ///
    /// Returns `true` once the worker confirms the database is ready. If the
    /// worker cannot materialize the image, or answers `ready: false`, every
    /// later command except another `open` fails with
    /// [`BridgeError::Unavailable`].
    pub async fn open(&self, image: Option<Vec<u8>>) -> BridgeResult<bool> {
        let command = Command::open(image);
        let id = command.id.clone();

        let result = match self.request(command).await {
            Ok(Event::Opened { ready: true }) => Ok(true),
            Ok(Event::Opened { ready: false }) => Err(BridgeError::NotReady),
            Ok(_) => Err(ProtocolError::UnexpectedResponse {
                id,
                expected: "ready",
            }
            .into()),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                tracing::debug!("database opened");
                self.set_state(BridgeState::Open);
            }
            Err(BridgeError::Closed) => {}
            Err(e) => {
                tracing::warn!(error = %e, "database open failed");
                self.set_state(BridgeState::Failed(e.to_string()));
            }
        }

        result
    }

    /// Execute SQL and return every result table it produced.
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        params: Option<Params>,
    ) -> BridgeResult<Vec<ResultTable>> {
        let command = Command::exec(sql, params);
        let id = command.id.clone();

        match self.request(command).await? {
            Event::Executed(results) => Ok(results),
            _ => Err(ProtocolError::UnexpectedResponse {
                id,
                expected: "results",
            }
            .into()),
        }
    }

    /// Stream the rows of a query into `on_row`, one call per row.
    ///
    /// Returns the number of rows delivered. If the worker fails mid-stream
    /// the call fails and rows already handed to `on_row` stay handed. If
    /// `on_row` fails, the remaining rows are abandoned and the failure is
    /// returned as [`BridgeError::Consumer`].
    pub async fn each<F>(
        &self,
        sql: impl Into<String>,
        params: Option<Params>,
        mut on_row: F,
    ) -> BridgeResult<usize>
    where
        F: FnMut(FlatRow) -> Result<(), ConsumerFailure>,
    {
        let mut rows = self.rows(sql, params).await?;
        let mut delivered = 0;

        while let Some(row) = rows.next_row().await? {
            on_row(row).map_err(BridgeError::Consumer)?;
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Start a row stream for a query.
    pub async fn rows(
        &self,
        sql: impl Into<String>,
        params: Option<Params>,
    ) -> BridgeResult<RowStream<'_>> {
        let command = Command::each(sql, params);
        self.check_usable(command.action)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.register(&command.id, Waiter::Stream(tx))?;

        self.post(&command).await?;

        Ok(RowStream {
            bridge: self,
            id: command.id,
            receiver: rx,
            state: StreamState::Idle,
            guard: Some(guard),
        })
    }

    /// Export the current database image.
    pub async fn export_image(&self) -> BridgeResult<Vec<u8>> {
        let command = Command::export();
        let id = command.id.clone();

        match self.request(command).await? {
            Event::Exported(buffer) => Ok(buffer),
            _ => Err(ProtocolError::UnexpectedResponse {
                id,
                expected: "buffer",
            }
            .into()),
        }
    }

    /// Close the database and tear the bridge down.
    ///
    /// After this returns `Ok`, outstanding waiters are rejected and every
    /// further call fails with [`BridgeError::Closed`].
    pub async fn close(&self) -> BridgeResult<()> {
        self.request(Command::close()).await?;

        self.set_state(BridgeState::Closed);
        let rejected = self.pending.drain();
        self.outbound.write().await.take();

        tracing::debug!(rejected, "bridge closed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.state_guard().clone()
    }

    /// Number of requests waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Number of responses discarded because no request was waiting for them.
    pub fn discarded(&self) -> u64 {
        self.pending.discarded.load(Ordering::Relaxed)
    }

    /// Check if the worker is still reachable.
    pub fn is_alive(&self) -> bool {
        !self.dispatcher.is_finished() && self.worker.is_running()
    }

    /// Get the current request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the request timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Progress of one row stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Between chunks; the next call will wait for one.
    Idle,
    /// Waiting for the worker's next chunk.
    AwaitingChunk,
    /// The worker signalled the end of the rows.
    Finished,
    /// The stream failed; no further rows will be read.
    Failed,
}

/// Rows of one `each` command, pulled one chunk at a time.
///
/// All chunks share the command's correlation id. Dropping the stream
/// removes its pending entry; chunks that still arrive are discarded.
pub struct RowStream<'a> {
    bridge: &'a Bridge,
    id: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    state: StreamState,
    guard: Option<PendingGuard>,
}

impl<'a> RowStream<'a> {
    /// Correlation id shared by every chunk of this stream.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Wait for the next row. `Ok(None)` once the stream is over.
    pub async fn next_row(&mut self) -> BridgeResult<Option<FlatRow>> {
        if matches!(self.state, StreamState::Finished | StreamState::Failed) {
            return Ok(None);
        }
        self.state = StreamState::AwaitingChunk;

        let timeout = self.bridge.timeout;
        let response = match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(Ok(response))) => response,
            Ok(Some(Err(e))) => return self.fail(e.into()),
            Ok(None) => {
                let err = self.bridge.disconnected();
                return self.fail(err);
            }
            Err(_) => return self.fail(BridgeError::Timeout(timeout)),
        };

        match response.into_event() {
            Event::Row {
                row,
                finished: false,
            } => {
                self.state = StreamState::Idle;
                Ok(Some(row))
            }
            Event::Row { finished: true, .. } | Event::Done { finished: true } => {
                self.state = StreamState::Finished;
                self.guard.take();
                Ok(None)
            }
            Event::Error(message) => self.fail(BridgeError::Engine(message)),
            _ => {
                let err = ProtocolError::UnexpectedResponse {
                    id: self.id.clone(),
                    expected: "row",
                };
                self.fail(err.into())
            }
        }
    }

    fn fail(&mut self, err: BridgeError) -> BridgeResult<Option<FlatRow>> {
        self.state = StreamState::Failed;
        self.guard.take();
        Err(err)
    }

    /// Adapt into a [`Stream`] of rows. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = BridgeResult<FlatRow>> + 'a {
        futures::stream::unfold(self, |mut rows| async move {
            match rows.next_row().await {
                Ok(Some(row)) => Some((Ok(row), rows)),
                Ok(None) => None,
                Err(e) => Some((Err(e), rows)),
            }
        })
    }
}
