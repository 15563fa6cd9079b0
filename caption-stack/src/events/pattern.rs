//! Event-bus content filtering.
//!
//! Implements the matching rules of an EventBridge event pattern: every key
//! in the pattern must match the event, nested objects recurse, and a leaf
//! is a non-empty array of alternatives. Alternatives are literals or one
//! of the content filters `prefix`, `suffix`, `equals-ignore-case`,
//! `wildcard`, `anything-but`, `exists` and `numeric`.

use crate::errors::{codes, ErrorInfo, SynthesisError};
use crate::utils::glob_match;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised for malformed patterns.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid event pattern at '{path}': {reason}")]
pub struct PatternError {
    /// Dotted path of the offending field.
    pub path: String,
    /// What is wrong with it.
    pub reason: String,
}

impl PatternError {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
            reason: reason.into(),
        }
    }
}

impl From<PatternError> for SynthesisError {
    fn from(err: PatternError) -> Self {
        Self::new(err.to_string()).with_error_info(
            ErrorInfo::new(codes::EVENT_PATTERN, "Malformed event pattern")
                .with_context_entry("path", err.path),
        )
    }
}

/// A validated event pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct EventPattern(pub(crate) Map<String, Value>);

impl EventPattern {
    /// Validates and wraps a pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a non-empty object whose leaves
    /// are non-empty arrays of supported matchers.
    pub fn new(value: Value) -> Result<Self, PatternError> {
        match value {
            Value::Object(map) if !map.is_empty() => {
                validate_object(&map, "")?;
                Ok(Self(map))
            }
            Value::Object(_) => Err(PatternError::new("", "pattern must not be empty")),
            _ => Err(PatternError::new("", "pattern must be an object")),
        }
    }

    /// Returns true if the event matches the pattern.
    #[must_use]
    pub fn matches(&self, event: &Value) -> bool {
        match_object(&self.0, event)
    }

    /// Returns the pattern as JSON.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Returns a top-level field of the pattern.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl TryFrom<Value> for EventPattern {
    type Error = PatternError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventPattern> for Value {
    fn from(pattern: EventPattern) -> Self {
        Self::Object(pattern.0)
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn validate_object(map: &Map<String, Value>, path: &str) -> Result<(), PatternError> {
    for (key, value) in map {
        let here = join_path(path, key);
        match value {
            Value::Object(nested) if !nested.is_empty() => validate_object(nested, &here)?,
            Value::Array(matchers) if !matchers.is_empty() => {
                for matcher in matchers {
                    validate_matcher(matcher, &here)?;
                }
            }
            Value::Array(_) => return Err(PatternError::new(&here, "matcher list must not be empty")),
            _ => return Err(PatternError::new(&here, "expected a nested object or an array of matchers")),
        }
    }
    Ok(())
}

fn validate_matcher(matcher: &Value, path: &str) -> Result<(), PatternError> {
    let Value::Object(filter) = matcher else {
        return match matcher {
            Value::Array(_) => Err(PatternError::new(path, "nested arrays are not matchers")),
            _ => Ok(()),
        };
    };
    let mut entries = filter.iter();
    let (Some((op, arg)), None) = (entries.next(), entries.next()) else {
        return Err(PatternError::new(path, "a content filter has exactly one operator"));
    };
    let valid = match op.as_str() {
        "prefix" | "suffix" => arg.is_string() || arg.get("equals-ignore-case").is_some_and(Value::is_string),
        "equals-ignore-case" | "wildcard" => arg.is_string(),
        "exists" => arg.is_boolean(),
        "anything-but" => match arg {
            Value::Array(items) => !items.is_empty() && items.iter().all(|i| i.is_string() || i.is_number()),
            Value::Object(inner) => inner.get("prefix").is_some_and(Value::is_string),
            other => other.is_string() || other.is_number(),
        },
        "numeric" => validate_numeric(arg),
        _ => return Err(PatternError::new(path, format!("unsupported operator '{op}'"))),
    };
    if valid {
        Ok(())
    } else {
        Err(PatternError::new(path, format!("invalid argument for '{op}'")))
    }
}

fn validate_numeric(arg: &Value) -> bool {
    let Value::Array(items) = arg else {
        return false;
    };
    !items.is_empty()
        && items.len() % 2 == 0
        && items.chunks(2).all(|pair| {
            matches!(pair[0].as_str(), Some("<" | "<=" | "=" | ">" | ">=")) && pair[1].is_number()
        })
}

fn match_object(pattern: &Map<String, Value>, event: &Value) -> bool {
    pattern.iter().all(|(key, expected)| {
        let actual = event.get(key);
        match expected {
            Value::Object(nested) => actual.is_some_and(|a| match_object(nested, a)),
            Value::Array(matchers) => matchers.iter().any(|m| match_field(m, actual)),
            _ => false,
        }
    })
}

fn match_field(matcher: &Value, actual: Option<&Value>) -> bool {
    if let Some(Value::Bool(should_exist)) = matcher.get("exists") {
        return actual.is_some() == *should_exist;
    }
    match actual {
        None => false,
        Some(Value::Array(items)) => items.iter().any(|item| match_scalar(matcher, item)),
        Some(value) => match_scalar(matcher, value),
    }
}

fn match_scalar(matcher: &Value, value: &Value) -> bool {
    let Value::Object(filter) = matcher else {
        return matcher == value || numbers_equal(matcher, value);
    };
    let Some((op, arg)) = filter.iter().next() else {
        return false;
    };
    let text = value.as_str();
    match op.as_str() {
        "prefix" => text.is_some_and(|t| affix_matches(arg, t, |text, affix| text.starts_with(affix))),
        "suffix" => text.is_some_and(|t| affix_matches(arg, t, |text, affix| text.ends_with(affix))),
        "equals-ignore-case" => text.is_some_and(|t| arg.as_str().is_some_and(|a| a.eq_ignore_ascii_case(t))),
        "wildcard" => text.is_some_and(|t| arg.as_str().is_some_and(|a| glob_match(a, t))),
        "anything-but" => !match arg {
            Value::Array(items) => items.iter().any(|i| i == value || numbers_equal(i, value)),
            Value::Object(inner) => inner
                .get("prefix")
                .and_then(Value::as_str)
                .is_some_and(|p| text.is_some_and(|t| t.starts_with(p))),
            other => other == value || numbers_equal(other, value),
        },
        "numeric" => value.as_f64().is_some_and(|n| numeric_matches(arg, n)),
        _ => false,
    }
}

fn affix_matches(arg: &Value, text: &str, check: fn(&str, &str) -> bool) -> bool {
    match arg {
        Value::String(s) => check(text, s),
        Value::Object(inner) => inner
            .get("equals-ignore-case")
            .and_then(Value::as_str)
            .is_some_and(|s| check(&text.to_ascii_lowercase(), &s.to_ascii_lowercase())),
        _ => false,
    }
}

fn numbers_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

fn numeric_matches(arg: &Value, n: f64) -> bool {
    let Some(items) = arg.as_array() else {
        return false;
    };
    items.chunks(2).all(|pair| {
        let Some(bound) = pair.get(1).and_then(Value::as_f64) else {
            return false;
        };
        match pair[0].as_str() {
            Some("<") => n < bound,
            Some("<=") => n <= bound,
            Some("=") => (n - bound).abs() < f64::EPSILON,
            Some(">") => n > bound,
            Some(">=") => n >= bound,
            _ => false,
        }
    })
}
