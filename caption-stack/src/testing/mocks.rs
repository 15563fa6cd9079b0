//! Mock function handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::CloudError;
use crate::simulation::{FunctionHandler, InvocationContext};

/// A handler that records every event and returns a fixed response.
#[derive(Debug)]
pub struct RecordingHandler {
    response: Mutex<Value>,
    events: Mutex<Vec<Value>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingHandler {
    /// Creates a handler that responds with `null`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            response: Mutex::new(Value::Null),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Sets the response.
    pub fn set_response(&self, response: Value) {
        *self.response.lock() = response;
    }

    /// Returns the number of times the handler ran.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns the events received, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().clone()
    }

    /// Forgets recorded events.
    pub fn reset(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl FunctionHandler for RecordingHandler {
    async fn handle(&self, event: Value, _context: &InvocationContext) -> Result<Value, CloudError> {
        self.events.lock().push(event);
        Ok(self.response.lock().clone())
    }
}

/// A handler that always fails.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    /// Creates a handler failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl FunctionHandler for FailingHandler {
    async fn handle(&self, _event: Value, context: &InvocationContext) -> Result<Value, CloudError> {
        Err(CloudError::HandlerFailed {
            function: context.function_name.clone(),
            message: self.message.clone(),
        })
    }
}
