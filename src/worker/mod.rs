//! Bridge to the database worker.
//!
//! The database engine runs in its own execution context, either a dedicated
//! thread or a child process. The [`Bridge`] presents it as an async API:
//! each call posts a command and resolves when the matching response comes
//! back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Caller (Rust + Tokio)                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                      Bridge (Async)                       │  │
//! │  │  - Correlation ids on every command                       │  │
//! │  │  - Pending table of waiters, removed on every exit path   │  │
//! │  │  - Row streams for `each`                                 │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                   │
//! │                 Command      │      Response                     │
//! │                              ▼                                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Worker (thread, or `sqlbridge worker` process)         │
//! │                     SQLite engine + image                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sqlbridge::engine::SqliteEngine;
//! use sqlbridge::worker::{protocol::Params, Bridge};
//!
//! let bridge = Bridge::spawn_thread(SqliteEngine::new()?)?;
//! bridge.open(None).await?;
//!
//! let count = bridge
//!     .each("SELECT * FROM Products WHERE Name = $name",
//!           Some(Params::named([("name", "Chair".into())])),
//!           |row| { println!("{:?}", row); Ok(()) })
//!     .await?;
//!
//! bridge.close().await?;
//! ```

mod client;
mod error;
pub mod protocol;
pub mod transport;

pub use client::{Bridge, BridgeState, RowStream, StreamState};
pub use error::{BridgeError, BridgeResult, ChannelError, ConsumerFailure, ProtocolError};
pub use transport::{Inbound, Outbound, ResponseSender, Undecodable, WorkerChannel, WorkerEnd, WorkerHandle};
