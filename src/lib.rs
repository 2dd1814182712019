//! # sqlbridge
//!
//! Async access to an embedded SQLite database running in an isolated
//! worker, plus reconstruction of nested records from flat join rows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │             Database (open / query / persist)            │
//! └─────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼ [worker]                     ▼ [store]
//! ┌──────────────────────────────┐  ┌──────────────────────┐
//! │ Bridge: ids, pending table,  │  │ ImageStore: key ->    │
//! │ row streams                  │  │ database image        │
//! └──────────────────────────────┘  └──────────────────────┘
//!                │ Command / Response
//!                ▼ [engine]
//! ┌─────────────────────────────────────────────────────────┐
//! │      Worker thread or process: SqliteEngine             │
//! └─────────────────────────────────────────────────────────┘
//!                │ flat rows
//!                ▼ [rows]
//! ┌─────────────────────────────────────────────────────────┐
//! │   decode_row / RowAccumulator: nested, merged entities   │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod database;
pub mod engine;
pub mod logging;
pub mod rows;
pub mod store;
pub mod worker;
