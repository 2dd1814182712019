//! Bridge error types.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Boxed error returned by a row consumer.
pub type ConsumerFailure = Box<dyn StdError + Send + Sync>;

/// Errors that can occur while talking to the worker.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The command could not be delivered or the response could not be decoded.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The worker reported a failure. Carries the engine message verbatim.
    #[error("{0}")]
    Engine(String),

    /// The worker broke the correlation protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The `each` row callback failed.
    #[error("row consumer failed: {0}")]
    Consumer(#[source] ConsumerFailure),

    /// No response arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The bridge was closed; it accepts no further commands.
    #[error("bridge is closed")]
    Closed,

    /// The worker answered `open` without confirming the database is ready.
    #[error("worker did not confirm the database is ready")]
    NotReady,

    /// The last `open` failed, so the database was never initialized.
    #[error("database unavailable, open failed: {0}")]
    Unavailable(String),
}

/// Transport-level failures.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// Failed to write to the worker.
    #[error("failed to write to worker: {0}")]
    Write(#[source] io::Error),

    /// Failed to read from the worker.
    #[error("failed to read from worker: {0}")]
    Read(#[source] io::Error),

    /// Failed to encode a command.
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),

    /// Failed to decode a response.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The outbound channel no longer accepts commands.
    #[error("worker is not accepting commands")]
    Send,

    /// The worker went away while a caller was waiting.
    #[error("worker disconnected")]
    Disconnected,
}

/// Correlation protocol violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A response arrived for an id with no pending entry.
    #[error("no pending request for id {0}")]
    UnknownId(String),

    /// A command was issued under an id that is already in flight.
    #[error("id {0} is already in flight")]
    DuplicateId(String),

    /// The response shape does not match the command.
    #[error("unexpected response for id {id}: expected {expected}")]
    UnexpectedResponse {
        /// Correlation id.
        id: String,
        /// What the command was waiting for.
        expected: &'static str,
    },
}

impl BridgeError {
    /// Check if this error was reported by the engine.
    pub fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }

    /// Check if this error means the worker can no longer be reached.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Channel(ChannelError::Disconnected | ChannelError::Send)
        )
    }

    /// Engine message, if this is an engine failure.
    pub fn engine_message(&self) -> Option<&str> {
        match self {
            Self::Engine(message) => Some(message),
            _ => None,
        }
    }
}
