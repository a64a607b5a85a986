//! Result merging strategies
//!
//! Combines per-chunk results into one logical result, always in original
//! index order. A caller-supplied merge function is used unconditionally
//! when present; otherwise a closed decision table applies: strings
//! concatenate, arrays flatten, JSON objects shallow-merge left-to-right.
//! A shape outside the table raises [`MergeError`] rather than silently
//! truncating to the first result.

use serde_json::Value;
use std::sync::Arc;

use crate::error::MergeError;

/// Caller-supplied merge function
pub type MergeFn<R> = Arc<dyn Fn(Vec<R>) -> Result<R, MergeError> + Send + Sync>;

/// Result types the default decision table covers
pub trait DefaultMerge: Sized {
    fn merge_ordered(parts: Vec<Self>) -> Result<Self, MergeError>;
}

impl DefaultMerge for String {
    fn merge_ordered(parts: Vec<Self>) -> Result<Self, MergeError> {
        Ok(parts.concat())
    }
}

impl<T> DefaultMerge for Vec<T> {
    fn merge_ordered(parts: Vec<Self>) -> Result<Self, MergeError> {
        Ok(parts.into_iter().flatten().collect())
    }
}

impl DefaultMerge for Value {
    fn merge_ordered(parts: Vec<Self>) -> Result<Self, MergeError> {
        merge_values(parts)
    }
}

/// Merge dynamic results by the shape of the first settled value.
///
/// The table is closed: string, array, and object are the only recognized
/// shapes, and every later value must match the first.
pub fn merge_values(parts: Vec<Value>) -> Result<Value, MergeError> {
    let Some(first) = parts.first() else {
        return Err(MergeError::Empty);
    };

    match first {
        Value::String(_) => {
            let mut merged = String::new();
            for (index, part) in parts.into_iter().enumerate() {
                match part {
                    Value::String(s) => merged.push_str(&s),
                    other => {
                        return Err(MergeError::Mixed {
                            first: "string",
                            offending: value_kind(&other),
                            index,
                        })
                    }
                }
            }
            Ok(Value::String(merged))
        }
        Value::Array(_) => {
            let mut merged = Vec::new();
            for (index, part) in parts.into_iter().enumerate() {
                match part {
                    Value::Array(items) => merged.extend(items),
                    other => {
                        return Err(MergeError::Mixed {
                            first: "array",
                            offending: value_kind(&other),
                            index,
                        })
                    }
                }
            }
            Ok(Value::Array(merged))
        }
        Value::Object(_) => {
            let mut merged = serde_json::Map::new();
            for (index, part) in parts.into_iter().enumerate() {
                match part {
                    Value::Object(map) => merged.extend(map),
                    other => {
                        return Err(MergeError::Mixed {
                            first: "object",
                            offending: value_kind(&other),
                            index,
                        })
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        other => Err(MergeError::NoStrategy {
            kind: value_kind(other),
        }),
    }
}

/// Shape name used in merge errors.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Apply the custom merge function when present, the default table otherwise.
pub fn merge_with<R: DefaultMerge>(
    custom: Option<&MergeFn<R>>,
    parts: Vec<R>,
) -> Result<R, MergeError> {
    match custom {
        Some(f) => f(parts),
        None => R::merge_ordered(parts),
    }
}
