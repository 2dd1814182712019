//! Flat row -> nested record.

use serde_json::{Map, Value};

use super::{RowError, RowResult};
use crate::worker::protocol::{FlatRow, ResultTable};

/// Separates nesting levels in a column name.
pub const DELIMITER: char = '_';

/// Deepest nesting a column name may encode.
pub const MAX_DEPTH: usize = 16;

/// Resolve a column name into its nesting path.
///
/// Every segment has its first character lower-cased. A name with an empty
/// segment (leading, trailing or doubled delimiter) is not nested: the whole
/// name becomes one leaf.
///
/// ```
/// use sqlbridge::rows::column_path;
///
/// assert_eq!(column_path("Store_Company"), vec!["store", "company"]);
/// assert_eq!(column_path("StoreId"), vec!["storeId"]);
/// assert_eq!(column_path("_rowid_"), vec!["_rowid_"]);
/// ```
pub fn column_path(column: &str) -> Vec<String> {
    let segments: Vec<&str> = column.split(DELIMITER).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return vec![lower_first(column)];
    }
    segments.into_iter().map(lower_first).collect()
}

fn lower_first(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fold one flat row into a nested record.
///
/// Column order does not matter. If a scalar column and a nested path claim
/// the same name, the nested object is kept.
pub fn decode_row(row: &FlatRow) -> RowResult<Map<String, Value>> {
    let mut record = Map::new();

    for (column, value) in row {
        let path = column_path(column);
        if path.len() > MAX_DEPTH {
            return Err(RowError::TooDeep {
                column: column.clone(),
                depth: path.len(),
                limit: MAX_DEPTH,
            });
        }
        assign(&mut record, &path, value.clone());
    }

    Ok(record)
}

fn assign(record: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((leaf, parents)) = path.split_last() else {
        return;
    };

    let mut current = record;
    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        current = next;
    }

    if !matches!(current.get(leaf), Some(Value::Object(_))) || value.is_object() {
        current.insert(leaf.clone(), value);
    }
}

/// Decode every row of a result table.
pub fn decode_table(table: &ResultTable) -> RowResult<Vec<Map<String, Value>>> {
    table.rows().map(|row| decode_row(&row)).collect()
}

/// Flatten a nested record into delimiter-joined columns.
///
/// Inverse of [`decode_row`] for records whose keys start lower-case,
/// contain no delimiter, and whose nested objects are non-empty.
pub fn encode_row(record: &Map<String, Value>) -> FlatRow {
    let mut row = FlatRow::new();
    encode_into(&mut row, None, record);
    row
}

fn encode_into(row: &mut FlatRow, prefix: Option<&str>, record: &Map<String, Value>) {
    for (key, value) in record {
        let column = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, DELIMITER, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => encode_into(row, Some(&column), nested),
            other => {
                row.insert(column, other.clone());
            }
        }
    }
}
