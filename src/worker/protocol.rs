//! Protocol types for worker communication.
//!
//! Commands flow from the bridge to the worker, responses flow back. Both
//! carry the same correlation `id`. Field names are part of the wire format:
//!
//! ```text
//! command:  { id, action: "open"|"exec"|"each"|"export"|"close", sql?, params?, buffer? }
//! response: { id, error? } | { id, ready } | { id, results } | { id, row, finished }
//!           | { id, finished } | { id, buffer } | { id }
//! ```
//!
//! Byte buffers are base64 strings when encoded as JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single result record keyed by column name, in column order.
pub type FlatRow = Map<String, Value>;

// ============================================================================
// Commands
// ============================================================================

/// Worker action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Open,
    Exec,
    Each,
    Export,
    Close,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Exec => "exec",
            Action::Each => "each",
            Action::Export => "export",
            Action::Close => "close",
        }
    }
}

/// Bound statement parameters.
///
/// Named parameters may be given with their SQLite prefix (`$name`, `:name`,
/// `@name`) or without one, in which case the first prefix the statement
/// declares is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Build named parameters from `(name, value)` pairs.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build positional parameters.
    pub fn positional<V, I>(values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }
}

/// Request sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique id for correlation.
    pub id: String,
    /// What the worker should do.
    pub action: Action,
    /// SQL text for `exec` and `each`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    /// Bound parameters for `exec` and `each`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Database image for `open`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_buffer"
    )]
    pub buffer: Option<Vec<u8>>,
}

impl Command {
    fn new(action: Action) -> Self {
        Self {
            id: new_id(),
            action,
            sql: None,
            params: None,
            buffer: None,
        }
    }

    /// `open`, optionally restoring an existing image.
    pub fn open(buffer: Option<Vec<u8>>) -> Self {
        Self {
            buffer,
            ..Self::new(Action::Open)
        }
    }

    /// `exec`.
    pub fn exec(sql: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            sql: Some(sql.into()),
            params,
            ..Self::new(Action::Exec)
        }
    }

    /// `each`.
    pub fn each(sql: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            sql: Some(sql.into()),
            params,
            ..Self::new(Action::Each)
        }
    }

    /// `export`.
    pub fn export() -> Self {
        Self::new(Action::Export)
    }

    /// `close`.
    pub fn close() -> Self {
        Self::new(Action::Close)
    }
}

/// Generate a collision-resistant correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Pull the `id` out of a message that failed to decode, if it has one.
pub fn recover_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(String::from)
}

// ============================================================================
// Responses
// ============================================================================

/// One result table: column names plus value rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl ResultTable {
    /// Iterate the table as flat rows keyed by column name.
    pub fn rows(&self) -> impl Iterator<Item = FlatRow> + '_ {
        self.values.iter().map(move |values| {
            self.columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect()
        })
    }

    /// Number of value rows.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table has no value rows.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Response envelope received from the worker.
///
/// Every variant of the protocol is a subset of these fields; use
/// [`Response::into_event`] to classify it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the command this responds to.
    pub id: String,
    /// Failure description. Marks the response as an error regardless of action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Readiness flag for `open`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    /// Result tables for `exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ResultTable>>,
    /// One streamed row for `each`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<FlatRow>,
    /// Stream state for `each`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    /// Database image for `export`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_buffer"
    )]
    pub buffer: Option<Vec<u8>>,
}

impl Response {
    fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_id(id)
        }
    }

    pub fn ready(id: impl Into<String>) -> Self {
        Self {
            ready: Some(true),
            ..Self::with_id(id)
        }
    }

    pub fn results(id: impl Into<String>, results: Vec<ResultTable>) -> Self {
        Self {
            results: Some(results),
            ..Self::with_id(id)
        }
    }

    pub fn row(id: impl Into<String>, row: FlatRow) -> Self {
        Self {
            row: Some(row),
            finished: Some(false),
            ..Self::with_id(id)
        }
    }

    pub fn done(id: impl Into<String>) -> Self {
        Self {
            finished: Some(true),
            ..Self::with_id(id)
        }
    }

    pub fn buffer(id: impl Into<String>, buffer: Vec<u8>) -> Self {
        Self {
            buffer: Some(buffer),
            ..Self::with_id(id)
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        Self::with_id(id)
    }

    /// Whether this response marks a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether no further response will follow under this id.
    ///
    /// Only meaningful for streams; every non-streaming response is terminal.
    pub fn ends_stream(&self) -> bool {
        self.is_error() || self.finished == Some(true)
    }

    /// Classify the envelope.
    pub fn into_event(self) -> Event {
        if let Some(message) = self.error {
            return Event::Error(message);
        }
        if let Some(row) = self.row {
            return Event::Row {
                row,
                finished: self.finished.unwrap_or(false),
            };
        }
        if let Some(results) = self.results {
            return Event::Executed(results);
        }
        if let Some(buffer) = self.buffer {
            return Event::Exported(buffer);
        }
        if let Some(ready) = self.ready {
            return Event::Opened { ready };
        }
        if let Some(finished) = self.finished {
            return Event::Done { finished };
        }
        Event::Ack
    }
}

/// A classified response.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Error(String),
    Opened { ready: bool },
    Executed(Vec<ResultTable>),
    Row { row: FlatRow, finished: bool },
    Done { finished: bool },
    Exported(Vec<u8>),
    Ack,
}

mod base64_buffer {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        buffer: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match buffer {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}
