//! Object-storage notifications.

use crate::core::Expr;
use crate::utils::{event_time, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Object-storage event types the stack subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum S3EventType {
    /// A `PUT` upload completed.
    #[serde(rename = "s3:ObjectCreated:Put")]
    ObjectCreatedPut,
    /// A multipart upload completed.
    #[serde(rename = "s3:ObjectCreated:CompleteMultipartUpload")]
    ObjectCreatedMultipart,
    /// An object was copied in.
    #[serde(rename = "s3:ObjectCreated:Copy")]
    ObjectCreatedCopy,
    /// An object was deleted.
    #[serde(rename = "s3:ObjectRemoved:Delete")]
    ObjectRemovedDelete,
}

impl S3EventType {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectCreatedPut => "s3:ObjectCreated:Put",
            Self::ObjectCreatedMultipart => "s3:ObjectCreated:CompleteMultipartUpload",
            Self::ObjectCreatedCopy => "s3:ObjectCreated:Copy",
            Self::ObjectRemovedDelete => "s3:ObjectRemoved:Delete",
        }
    }

    /// Event name as it appears inside a delivered record (no `s3:` prefix).
    #[must_use]
    pub fn record_name(&self) -> &'static str {
        self.as_str().trim_start_matches("s3:")
    }
}

impl fmt::Display for S3EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object-key filter of a bucket notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
    /// Required key prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Required key suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl KeyFilter {
    /// Filter on a key prefix.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            suffix: None,
        }
    }

    /// Returns true if the key passes the filter.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
            && self.suffix.as_deref().map_or(true, |s| key.ends_with(s))
    }

    fn rules(&self) -> Vec<Expr> {
        let mut rules = Vec::new();
        if let Some(prefix) = &self.prefix {
            rules.push(Expr::map([("Name", Expr::from("prefix")), ("Value", Expr::from(prefix.as_str()))]));
        }
        if let Some(suffix) = &self.suffix {
            rules.push(Expr::map([("Name", Expr::from("suffix")), ("Value", Expr::from(suffix.as_str()))]));
        }
        rules
    }
}

/// A single bucket notification routed to a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFilter {
    /// Event type that fires the notification.
    pub event: S3EventType,
    /// Key filter.
    #[serde(default)]
    pub key: KeyFilter,
}

impl NotificationFilter {
    /// Put events under `prefix`.
    #[must_use]
    pub fn put_under(prefix: impl Into<String>) -> Self {
        Self {
            event: S3EventType::ObjectCreatedPut,
            key: KeyFilter::prefix(prefix),
        }
    }

    /// Returns true if an event of `event` type on `key` fires the notification.
    #[must_use]
    pub fn matches(&self, event: S3EventType, key: &str) -> bool {
        self.event == event && self.key.matches(key)
    }

    /// Reads a resolved `LambdaConfigurations` entry back into the filter
    /// and the target function ARN.
    #[must_use]
    pub fn from_configuration(entry: &Value) -> Option<(Self, String)> {
        let event = serde_json::from_value(entry.get("Event")?.clone()).ok()?;
        let function = entry.get("Function")?.as_str()?.to_string();
        let mut key = KeyFilter::default();
        let rules = entry
            .pointer("/Filter/S3Key/Rules")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for rule in rules {
            let value = rule.get("Value").and_then(Value::as_str).map(ToString::to_string);
            match rule.get("Name").and_then(Value::as_str) {
                Some("prefix") => key.prefix = value,
                Some("suffix") => key.suffix = value,
                _ => return None,
            }
        }
        Some((Self { event, key }, function))
    }

    /// Renders the `LambdaConfigurations` entry for a function.
    #[must_use]
    pub fn to_expr(&self, function_arn: Expr) -> Expr {
        let mut entry = vec![
            ("Event", Expr::from(self.event.as_str())),
            ("Function", function_arn),
        ];
        let rules = self.key.rules();
        if !rules.is_empty() {
            entry.push((
                "Filter",
                Expr::map([("S3Key", Expr::map([("Rules", Expr::list(rules))]))]),
            ));
        }
        Expr::map(entry)
    }
}

/// Builds the notification payload a function receives for one object event.
///
/// `bucket_arn` carries the partition, so it is passed in rather than derived
/// from `bucket`.
#[must_use]
pub fn object_event_record(
    event: S3EventType,
    region: &str,
    bucket: &str,
    bucket_arn: &str,
    key: &str,
    size: usize,
    at: &Timestamp,
) -> Value {
    json!({
        "Records": [{
            "eventVersion": "2.1",
            "eventSource": "aws:s3",
            "awsRegion": region,
            "eventTime": event_time(at),
            "eventName": event.record_name(),
            "s3": {
                "s3SchemaVersion": "1.0",
                "bucket": {
                    "name": bucket,
                    "arn": bucket_arn,
                },
                "object": {
                    "key": key,
                    "size": size,
                }
            }
        }]
    })
}
