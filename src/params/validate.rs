//! Parameter validation
//!
//! Strict, pure checking of caller values against a spec map. Keys absent
//! from the input are never defaulted here.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use super::{ParamKind, ParameterSpec};
use crate::types::ParamMap;

/// Which bound a value crossed
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Bound {
    Min(f64),
    Max(f64),
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Min(v) => write!(f, "min {}", v),
            Bound::Max(v) => write!(f, "max {}", v),
        }
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown parameter: {key}")]
    UnknownParameter { key: String },
    #[error("Parameter {key} expects {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: ParamKind,
        found: &'static str,
    },
    #[error("Parameter {key} = {value} is out of range ({bound})")]
    OutOfRange { key: String, value: f64, bound: Bound },
}

impl ValidationError {
    pub fn key(&self) -> &str {
        match self {
            ValidationError::UnknownParameter { key }
            | ValidationError::TypeMismatch { key, .. }
            | ValidationError::OutOfRange { key, .. } => key,
        }
    }
}

/// One-line summary of a list of violations
pub fn describe_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate `input` against `specs`.
///
/// Every violation is reported, in key order. Float parameters given as
/// integers are normalized to floats; nothing else is coerced.
pub fn validate(
    specs: &BTreeMap<String, ParameterSpec>,
    input: &ParamMap,
) -> Result<ParamMap, Vec<ValidationError>> {
    let mut output = ParamMap::new();
    let mut errors = Vec::new();

    for (key, value) in input {
        let Some(spec) = specs.get(key) else {
            errors.push(ValidationError::UnknownParameter { key: key.clone() });
            continue;
        };

        match check_value(key, spec, value) {
            Ok(normalized) => {
                output.insert(key.clone(), normalized);
            }
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(output)
    } else {
        Err(errors)
    }
}

fn check_value(key: &str, spec: &ParameterSpec, value: &Value) -> Result<Value, ValidationError> {
    let mismatch = || ValidationError::TypeMismatch {
        key: key.to_string(),
        expected: spec.kind,
        found: json_type_name(value),
    };

    match spec.kind {
        ParamKind::Boolean => value.as_bool().map(Value::Bool).ok_or_else(mismatch),
        ParamKind::String => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(mismatch),
        ParamKind::Integer => {
            let Value::Number(n) = value else {
                return Err(mismatch());
            };
            if !(n.is_i64() || n.is_u64()) {
                return Err(mismatch());
            }
            let numeric = n.as_f64().unwrap_or_default();
            check_range(key, spec, numeric)?;
            Ok(value.clone())
        }
        ParamKind::Float => {
            let numeric = value.as_f64().ok_or_else(mismatch)?;
            check_range(key, spec, numeric)?;
            Ok(Value::from(numeric))
        }
    }
}

fn check_range(key: &str, spec: &ParameterSpec, value: f64) -> Result<(), ValidationError> {
    if let Some(min) = spec.min {
        if value < min {
            return Err(ValidationError::OutOfRange {
                key: key.to_string(),
                value,
                bound: Bound::Min(min),
            });
        }
    }
    if let Some(max) = spec.max {
        if value > max {
            return Err(ValidationError::OutOfRange {
                key: key.to_string(),
                value,
                bound: Bound::Max(max),
            });
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
