//! Error types for the caption stack.
//!
//! Synthesis-time failures are fatal and carry a stable error code plus a
//! fix hint. Runtime failures only exist inside the simulated control plane
//! and are reported through [`CloudError`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The main error type for caption stack operations.
#[derive(Debug, Error)]
pub enum StackError {
    /// The resource graph failed validation.
    #[error("{0}")]
    Synthesis(#[from] SynthesisError),

    /// A cycle was detected in the resource graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// The configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A simulated cloud operation failed.
    #[error("{0}")]
    Cloud(#[from] CloudError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The log subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Error codes attached to synthesis errors.
pub mod codes {
    /// A reference or `DependsOn` entry names an unknown resource.
    pub const MISSING_REF: &str = "SYNTH-001-MISSING_REF";
    /// The dependency graph contains a cycle.
    pub const CYCLE: &str = "SYNTH-002-CYCLE";
    /// A logical ID is not alphanumeric.
    pub const INVALID_ID: &str = "SYNTH-003-INVALID_ID";
    /// A logical ID is declared twice.
    pub const DUPLICATE: &str = "SYNTH-004-DUPLICATE";
    /// A resource depends on itself.
    pub const SELF_DEP: &str = "SYNTH-005-SELF_DEP";
    /// A stack has no resources.
    pub const EMPTY: &str = "SYNTH-006-EMPTY";
    /// Network sizing is inconsistent.
    pub const NETWORK: &str = "SYNTH-010-NETWORK";
    /// A role or policy breaks the least-privilege rules.
    pub const IAM: &str = "SYNTH-020-IAM";
    /// An inference resource is malformed.
    pub const INFERENCE: &str = "SYNTH-030-INFERENCE";
    /// Data capture is not sampling everything.
    pub const CAPTURE: &str = "SYNTH-031-CAPTURE";
    /// An event pattern is malformed.
    pub const EVENT_PATTERN: &str = "SYNTH-040-EVENT_PATTERN";
    /// A configuration value is invalid.
    pub const CONFIG: &str = "SYNTH-050-CONFIG";
}

/// Diagnostic metadata attached to a synthesis error.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "SYNTH-002-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info record.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when the resource graph or one of its descriptors is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SynthesisError {
    /// The error message.
    pub message: String,
    /// Logical IDs of the resources involved.
    pub resources: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl SynthesisError {
    /// Creates a new synthesis error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resources: Vec::new(),
            error_info: None,
        }
    }

    /// Creates an error carrying a code whose summary repeats the message.
    #[must_use]
    pub fn coded(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(message.clone()).with_error_info(ErrorInfo::new(code, message))
    }

    /// Sets the resources involved.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Sets the fix hint, creating an info record if needed.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        let info = self
            .error_info
            .take()
            .unwrap_or_else(|| ErrorInfo::new("", self.message.clone()));
        self.error_info = Some(info.with_fix_hint(hint));
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the resource graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in resource graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The logical IDs forming the cycle; the first ID is repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for SynthesisError {
    fn from(err: CycleDetectedError) -> Self {
        Self::new(err.to_string())
            .with_resources(err.cycle_path.clone())
            .with_error_info(
                ErrorInfo::new(codes::CYCLE, "Resource dependencies form a cycle")
                    .with_fix_hint("Break the cycle by replacing one reference with a literal or a parameter."),
            )
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::StackConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configuration value is out of range.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for SynthesisError {
    fn from(err: ConfigError) -> Self {
        Self::coded(codes::CONFIG, err.to_string())
    }
}

/// Errors raised by the simulated control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum CloudError {
    /// The caller's role does not allow the action.
    #[error("AccessDenied: {principal} is not authorized to perform {action} on {resource}")]
    AccessDenied {
        /// The calling role.
        principal: String,
        /// The attempted action.
        action: String,
        /// The target resource ARN.
        resource: String,
    },

    /// A named resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of resource.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// A resource with the same name already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists {
        /// Kind of resource.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// A request failed service-side validation.
    #[error("ValidationException: {0}")]
    Validation(String),

    /// A function handler returned an error.
    #[error("Function {function} failed: {message}")]
    HandlerFailed {
        /// Function name.
        function: String,
        /// Error message reported by the handler.
        message: String,
    },

    /// Deploying or deleting a stack failed.
    #[error("Stack operation failed on {logical_id}: {reason}")]
    StackOperation {
        /// Logical ID of the failing resource.
        logical_id: String,
        /// Why it failed.
        reason: String,
    },
}

impl CloudError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Creates a stack operation error.
    #[must_use]
    pub fn stack_operation(logical_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StackOperation {
            logical_id: logical_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for synthesis operations.
pub type SynthResult<T> = Result<T, SynthesisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_error_with_info() {
        let err = SynthesisError::new("Endpoint depends on unknown resource")
            .with_resources(vec!["CaptionEndpoint".to_string()])
            .with_error_info(
                ErrorInfo::new(codes::MISSING_REF, "Dependency not found")
                    .with_fix_hint("Add the resource first")
                    .with_context_entry("missing", "CaptionEndpointConfig"),
            );

        assert_eq!(err.code(), Some(codes::MISSING_REF));
        assert_eq!(err.resources, vec!["CaptionEndpoint"]);
        let info = err.error_info.unwrap();
        assert_eq!(info.context["missing"], "CaptionEndpointConfig");
    }

    #[test]
    fn test_cycle_error_display() {
        let err = CycleDetectedError::new(vec!["A".into(), "B".into(), "A".into()]);
        assert_eq!(err.to_string(), "Cycle detected in resource graph: A -> B -> A");

        let synth: SynthesisError = err.into();
        assert_eq!(synth.code(), Some(codes::CYCLE));
        assert_eq!(synth.resources.len(), 3);
    }

    #[test]
    fn test_coded_error() {
        let err = SynthesisError::coded(codes::NETWORK, "too many subnets")
            .with_fix_hint("Use a larger network prefix");
        assert_eq!(err.code(), Some(codes::NETWORK));
        assert_eq!(
            err.error_info.unwrap().fix_hint.as_deref(),
            Some("Use a larger network prefix")
        );
    }

    #[test]
    fn test_stack_error_from_cloud() {
        let err: StackError = CloudError::not_found("Endpoint", "caption").into();
        assert_eq!(err.to_string(), "Endpoint not found: caption");
    }

    #[test]
    fn test_config_error_into_synthesis() {
        let err: SynthesisError = ConfigError::invalid("network.max_azs", "must be at least 1").into();
        assert_eq!(err.code(), Some(codes::CONFIG));
        assert!(err.message.contains("network.max_azs"));
    }
}
