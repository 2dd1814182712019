//! Merging join fan-out rows into entities.

use std::collections::HashMap;
use std::slice;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::decode::decode_row;
use super::RowResult;
use crate::worker::protocol::FlatRow;

/// Field holding an entity's identifier.
pub const ID_FIELD: &str = "id";

/// Canonical form of an identifier used as a merge key.
///
/// Numbers compare numerically, so `5` and `5.0` are one key. A string
/// `"5"` is a different key from the number `5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Integer(i64),
    Unsigned(u64),
    /// Non-integral float, by bit pattern.
    Float(u64),
    Text(String),
    Bool(bool),
    /// Arrays and objects, by their JSON text.
    Other(String),
}

impl RowKey {
    /// Canonicalize an identifier value. `None` for null.
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = match value {
            Value::Null => return None,
            Value::Bool(b) => RowKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RowKey::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    RowKey::Unsigned(u)
                } else {
                    let f = n.as_f64().unwrap_or(f64::NAN);
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                        RowKey::Integer(f as i64)
                    } else {
                        RowKey::Float(f.to_bits())
                    }
                }
            }
            Value::String(s) => RowKey::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => RowKey::Other(value.to_string()),
        };
        Some(key)
    }
}

/// Insertion-ordered entities keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct RowAccumulator {
    index: HashMap<RowKey, usize>,
    entities: Vec<Map<String, Value>>,
}

impl RowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an accumulator from a sequence of flat rows.
    pub fn from_rows<'a, I>(rows: I) -> RowResult<Self>
    where
        I: IntoIterator<Item = &'a FlatRow>,
    {
        let mut accumulator = Self::new();
        for row in rows {
            accumulator.merge(row)?;
        }
        Ok(accumulator)
    }

    /// Decode a flat row and merge it into the entity with the same `id`.
    ///
    /// Returns `false` without touching the accumulator when the row has no
    /// identifier, as a left join with no match produces.
    pub fn merge(&mut self, row: &FlatRow) -> RowResult<bool> {
        let record = decode_row(row)?;
        Ok(self.merge_record(record))
    }

    /// Merge an already decoded record.
    pub fn merge_record(&mut self, record: Map<String, Value>) -> bool {
        let Some(key) = record.get(ID_FIELD).and_then(RowKey::from_value) else {
            return false;
        };

        match self.index.get(&key) {
            Some(&slot) => deep_merge(&mut self.entities[slot], record),
            None => {
                self.index.insert(key, self.entities.len());
                let mut entity = Map::new();
                deep_merge(&mut entity, record);
                self.entities.push(entity);
            }
        }
        true
    }

    /// Entity for an identifier, if one was merged.
    pub fn get(&self, id: &Value) -> Option<&Map<String, Value>> {
        let key = RowKey::from_value(id)?;
        self.index.get(&key).map(|&slot| &self.entities[slot])
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in first-insertion order, completed from `default`.
    ///
    /// Fields that were never populated, or are null, take the default's
    /// value. A nested object whose leaves are all null (a left join that
    /// matched nothing) is replaced by the default's object. The iterator is
    /// lazy and can be restarted by cloning it before use.
    pub fn compile<F>(&self, default: F) -> Compiled<'_, F>
    where
        F: Fn() -> Value,
    {
        Compiled {
            entities: self.entities.iter(),
            default,
        }
    }

    /// Compile and deserialize every entity into `T`.
    pub fn compile_into<T, F>(&self, default: F) -> RowResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn() -> Value,
    {
        self.compile(default)
            .map(|entity| serde_json::from_value(entity).map_err(Into::into))
            .collect()
    }
}

/// Lazy iterator returned by [`RowAccumulator::compile`].
#[derive(Clone)]
pub struct Compiled<'a, F> {
    entities: slice::Iter<'a, Map<String, Value>>,
    default: F,
}

impl<F> Iterator for Compiled<'_, F>
where
    F: Fn() -> Value,
{
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let entity = self.entities.next()?;
        Some(fill_defaults(&(self.default)(), entity))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entities.size_hint()
    }
}

impl<F> ExactSizeIterator for Compiled<'_, F> where F: Fn() -> Value {}

/// Merge `source` into `target`.
///
/// Objects merge key by key. A non-null value overwrites, except that a
/// scalar never replaces a nested object. Nulls only fill absent fields.
fn deep_merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, incoming) in source {
        match target.get_mut(&key) {
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming) = incoming {
                    deep_merge(existing, incoming);
                }
            }
            Some(existing) => {
                if !incoming.is_null() {
                    *existing = incoming;
                }
            }
            None => {
                target.insert(key, incoming);
            }
        }
    }
}

fn fill_defaults(default: &Value, entity: &Map<String, Value>) -> Value {
    match default {
        Value::Object(defaults) => Value::Object(fill_object(defaults, entity)),
        _ => Value::Object(entity.clone()),
    }
}

fn fill_object(defaults: &Map<String, Value>, fields: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();

    for (key, field) in fields {
        let filled = match (defaults.get(key), field) {
            (Some(default), Value::Null) => default.clone(),
            (Some(Value::Object(default)), Value::Object(nested)) => {
                if all_null(nested) {
                    Value::Object(default.clone())
                } else {
                    Value::Object(fill_object(default, nested))
                }
            }
            _ => field.clone(),
        };
        result.insert(key.clone(), filled);
    }

    for (key, default) in defaults {
        if !result.contains_key(key) {
            result.insert(key.clone(), default.clone());
        }
    }

    result
}

fn all_null(fields: &Map<String, Value>) -> bool {
    fields.values().all(|value| match value {
        Value::Null => true,
        Value::Object(nested) => all_null(nested),
        _ => false,
    })
}
