//! Immutable records.
//!
//! A [`Record`] is a map scripts can read but never change. Fields are
//! reached with `record.field` or `record["field"]`; there are no setters,
//! so assignment to a field fails no matter how the record was bound.

use std::fmt;
use std::sync::Arc;

use rhai::{Array, Dynamic, Engine, ImmutableString, Map, INT};

/// Name scripts see from `type_of`
pub const RECORD_TYPE_NAME: &str = "record";

/// Read-only map of named fields
#[derive(Clone, Debug, Default)]
pub struct Record(Arc<Map>);

impl Record {
    /// Freeze a map
    #[must_use]
    pub fn new(fields: Map) -> Self {
        Self(Arc::new(fields))
    }

    /// Field value, `()` when absent
    #[must_use]
    pub fn get(&self, name: &str) -> Dynamic {
        self.0.get(name).cloned().unwrap_or(Dynamic::UNIT)
    }

    /// Field names in order
    #[must_use]
    pub fn keys(&self) -> Array {
        self.0.keys().map(|k| Dynamic::from(k.to_string())).collect()
    }

    /// Number of fields
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a field exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Plain map copy with nested records unwrapped
    #[must_use]
    pub fn to_map(&self) -> Map {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), to_plain(value.clone())))
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Dynamic::from_map(self.to_map()))
    }
}

/// Replace records inside `value` with plain maps, recursively.
///
/// Used before serializing script values, since the serializer only knows
/// the evaluator's own types.
#[must_use]
pub fn to_plain(value: Dynamic) -> Dynamic {
    if let Some(record) = value.read_lock::<Record>() {
        return Dynamic::from_map(record.to_map());
    }
    if value.is_array() {
        return value.try_cast::<Array>().map_or(Dynamic::UNIT, |items| {
            Dynamic::from_array(items.into_iter().map(to_plain).collect())
        });
    }
    if value.is_map() {
        return value.try_cast::<Map>().map_or(Dynamic::UNIT, |map| {
            Dynamic::from_map(
                map.into_iter()
                    .map(|(name, value)| (name, to_plain(value)))
                    .collect(),
            )
        });
    }
    value
}

/// Teach `engine` to read records
pub fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<Record>(RECORD_TYPE_NAME)
        .register_indexer_get(|record: &mut Record, name: ImmutableString| record.get(&name))
        .register_fn("keys", |record: &mut Record| record.keys())
        .register_fn("len", |record: &mut Record| {
            INT::try_from(record.len()).unwrap_or(INT::MAX)
        })
        .register_fn("is_empty", |record: &mut Record| record.is_empty())
        .register_fn("contains", |record: &mut Record, name: ImmutableString| {
            record.contains(&name)
        })
        .register_fn("to_map", |record: &mut Record| record.to_map())
        .register_fn("to_string", |record: &mut Record| record.to_string())
        .register_fn("to_debug", |record: &mut Record| record.to_string());
}
