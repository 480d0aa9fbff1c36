// src/value.rs

//! The opaque scalar/binary value carried by change records.
//!
//! Column values flow through the engine without it ever needing to know
//! their semantic type — they are bound as parameters on the way out and
//! read back as driver-native values on the way in. `rusqlite::types::Value`
//! already is exactly that tagged union (`Null`, `Integer`, `Real`, `Text`,
//! `Blob`) for the SQLite backend, so this module re-exports it under the
//! engine's own name rather than wrapping it for no reason.

pub use rusqlite::types::Value;

/// True if `value` is a SQL `NULL`.
pub fn is_null(value: &Value) -> bool {
    matches!(value, Value::Null)
}

/// True if `value` is a blob (used by the `[Contents]` null/blob-clash
/// recovery path in the applier).
pub fn is_blob(value: &Value) -> bool {
    matches!(value, Value::Blob(_))
}
