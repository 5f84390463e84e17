// crates/tga-core/src/canonical.rs
// ============================================================================
// Module: Canonicalizer
// Description: Deterministic byte serialization of structured values.
// Purpose: Provide a stable, RFC 8785-style canonical encoding for hashing and signing.
// Dependencies: serde, serde_json, serde_jcs
// ============================================================================

//! ## Overview
//! The canonicalizer turns a closed grammar of structured values (maps,
//! sequences, strings, safe integers, booleans, null) into a deterministic
//! byte string: sorted keys, no insignificant whitespace, minimal JSON
//! escapes, no fractional-part integers, no duplicate keys. Any value
//! outside the grammar — notably floats — is rejected as
//! `CANONICAL_UNSUPPORTED` rather than silently coerced.
//!
//! Canonicalization is pure and total on valid inputs.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Number;
use serde_json::Value as JsonValue;
use thiserror::Error;

// ============================================================================
// SECTION: Value Grammar
// ============================================================================

/// The closed value grammar accepted by the canonicalizer.
///
/// # Invariants
/// - `Map` keys are plain strings, held in a `BTreeMap`, so a value can never
///   carry two entries for the same key: building one via [`Value::map`]
///   from key/value pairs that repeat a key keeps only the last pair for
///   that key, the same last-write-wins rule `BTreeMap::from_iter` applies
///   everywhere else.
/// - `Int` is restricted to the safe-integer range `[-2^53, 2^53]` at the
///   canonicalization boundary, not at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// JSON null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value; range-checked during canonicalization.
    Int(i64),
    /// UTF-8 string value.
    Str(String),
    /// Ordered sequence of values.
    Seq(Vec<Value>),
    /// String-keyed map, sorted lexicographically by code point on encode.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a map value from an iterator of key/value pairs.
    #[must_use]
    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self::Map(entries.into_iter().collect())
    }
}

/// The safe-integer bound named in the canonicalization grammar: `2^53`.
pub const MAX_SAFE_INT: i64 = 1 << 53;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when a value falls outside the canonicalization grammar.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// A number fell outside the safe integer domain or carried a fractional part.
    #[error("value is outside the canonicalization domain: {0}")]
    Unsupported(String),
    /// The canonical serializer itself failed (should not occur for in-grammar values).
    #[error("canonical serialization failed: {0}")]
    Serialization(String),
}

// ============================================================================
// SECTION: Canonicalization
// ============================================================================

/// Serializes a [`Value`] into its canonical byte representation.
///
/// # Errors
///
/// Returns [`CanonicalError::Unsupported`] if any integer in the value tree
/// falls outside `[-2^53, 2^53]`.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let json = to_json(value)?;
    serde_jcs::to_vec(&json).map_err(|err| CanonicalError::Serialization(err.to_string()))
}

/// Canonicalizes any serializable value by first routing it through
/// `serde_json::Value` and rejecting out-of-domain numbers.
///
/// # Errors
///
/// Returns [`CanonicalError::Unsupported`] for floats, non-finite numbers, or
/// integers outside `[-2^53, 2^53]`. Returns [`CanonicalError::Serialization`]
/// if the value cannot be serialized to JSON at all.
pub fn canonicalize_serializable<T: Serialize + ?Sized>(
    value: &T,
) -> Result<Vec<u8>, CanonicalError> {
    let json =
        serde_json::to_value(value).map_err(|err| CanonicalError::Serialization(err.to_string()))?;
    reject_unsupported_numbers(&json)?;
    serde_jcs::to_vec(&json).map_err(|err| CanonicalError::Serialization(err.to_string()))
}

/// Converts the closed [`Value`] grammar into `serde_json::Value`, validating
/// the integer domain along the way.
fn to_json(value: &Value) -> Result<JsonValue, CanonicalError> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Bool(flag) => Ok(JsonValue::Bool(*flag)),
        Value::Int(number) => {
            if number.unsigned_abs() > u64::try_from(MAX_SAFE_INT).unwrap_or(u64::MAX) {
                return Err(CanonicalError::Unsupported(format!(
                    "integer {number} exceeds the safe range [-2^53, 2^53]"
                )));
            }
            Ok(JsonValue::Number(Number::from(*number)))
        }
        Value::Str(text) => Ok(JsonValue::String(text.clone())),
        Value::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_json(item)?);
            }
            Ok(JsonValue::Array(out))
        }
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries {
                out.insert(key.clone(), to_json(item)?);
            }
            Ok(JsonValue::Object(out))
        }
    }
}

/// Walks a `serde_json::Value` tree and rejects any number outside the
/// canonicalization domain (non-integers, or integers outside `[-2^53, 2^53]`).
fn reject_unsupported_numbers(value: &JsonValue) -> Result<(), CanonicalError> {
    match value {
        JsonValue::Number(number) => {
            let Some(as_i64) = number.as_i64() else {
                return Err(CanonicalError::Unsupported(format!(
                    "number {number} is not a representable safe integer"
                )));
            };
            if as_i64.unsigned_abs() > u64::try_from(MAX_SAFE_INT).unwrap_or(u64::MAX) {
                return Err(CanonicalError::Unsupported(format!(
                    "integer {as_i64} exceeds the safe range [-2^53, 2^53]"
                )));
            }
            Ok(())
        }
        JsonValue::Array(items) => {
            for item in items {
                reject_unsupported_numbers(item)?;
            }
            Ok(())
        }
        JsonValue::Object(entries) => {
            for item in entries.values() {
                reject_unsupported_numbers(item)?;
            }
            Ok(())
        }
        JsonValue::Null | JsonValue::Bool(_) | JsonValue::String(_) => Ok(()),
    }
}
