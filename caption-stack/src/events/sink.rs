//! Control-plane activity sinks.
//!
//! The simulated control plane reports what it does (resources created,
//! functions invoked, endpoints updated) as named activity records so tests
//! and the CLI can observe a run without scraping logs.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Activity record names emitted by the control plane.
pub mod activity {
    /// A stack resource was created.
    pub const RESOURCE_CREATED: &str = "stack.resource_created";
    /// A stack resource was deleted.
    pub const RESOURCE_DELETED: &str = "stack.resource_deleted";
    /// A stack resource was kept on teardown.
    pub const RESOURCE_RETAINED: &str = "stack.resource_retained";
    /// An object landed in a bucket.
    pub const OBJECT_PUT: &str = "storage.object_put";
    /// A function was invoked.
    pub const FUNCTION_INVOKED: &str = "function.invoked";
    /// A function invocation failed.
    pub const FUNCTION_FAILED: &str = "function.failed";
    /// A pipeline execution started.
    pub const PIPELINE_STARTED: &str = "pipeline.execution_started";
    /// A rule forwarded an event to its target.
    pub const RULE_MATCHED: &str = "rule.matched";
    /// An endpoint switched configuration.
    pub const ENDPOINT_UPDATED: &str = "endpoint.updated";
}

/// Receives activity records.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits a record asynchronously.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits a record without awaiting. Never fails.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes records to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (anything but DEBUG logs at INFO).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log(&self, event_type: &str, data: Option<&Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "activity: {event_type}");
        } else {
            info!(event_type = %event_type, event_data = ?data, "activity: {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log(event_type, data.as_ref());
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected records.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected records.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns records whose name starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Counts records named exactly `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events.read().iter().filter(|(t, _)| t == event_type).count()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}
