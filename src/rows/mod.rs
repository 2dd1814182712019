//! Row reconstruction.
//!
//! SQL joins return flat rows. Columns whose names follow the
//! `Parent_Child` convention are folded back into nested records:
//!
//! ```text
//! { Id: 1, Name: "A", Store_Id: 10, Store_Company: "X" }
//!     -> { id: 1, name: "A", store: { id: 10, company: "X" } }
//! ```
//!
//! A one-to-many join delivers the parent once per child. [`RowAccumulator`]
//! merges those rows by their `id` into one entity each, keeping the order
//! in which identifiers were first seen.

mod accumulator;
mod decode;

pub use accumulator::{Compiled, RowAccumulator, RowKey, ID_FIELD};
pub use decode::{column_path, decode_row, decode_table, encode_row, DELIMITER, MAX_DEPTH};

use thiserror::Error;

/// Result type for row reconstruction.
pub type RowResult<T> = Result<T, RowError>;

/// Errors that can occur while reconstructing records.
#[derive(Error, Debug)]
pub enum RowError {
    /// A column name nests deeper than [`MAX_DEPTH`].
    #[error("column {column} nests {depth} levels deep, the limit is {limit}")]
    TooDeep {
        column: String,
        depth: usize,
        limit: usize,
    },

    /// A compiled record does not fit the requested type.
    #[error("failed to build record: {0}")]
    Deserialize(#[from] serde_json::Error),
}
