//! The managed pipeline service's status-change event contract.
//!
//! The pinned shape is the documented SageMaker event: detail-type
//! `SageMaker Model Building Pipeline Execution Status Change`, the status
//! in `detail.currentPipelineExecutionStatus` and the pipeline identified by
//! `detail.pipelineArn`. Pipeline ARNs carry the pipeline name lowercased.

use super::EventPattern;
use crate::core::Expr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Event source of the managed ML service.
pub const SAGEMAKER_SOURCE: &str = "aws.sagemaker";

/// Detail-type of pipeline execution status changes.
pub const PIPELINE_STATUS_CHANGE: &str = "SageMaker Model Building Pipeline Execution Status Change";

/// Status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineExecutionStatus {
    /// Running.
    Executing,
    /// Stop requested.
    Stopping,
    /// Stopped before finishing.
    Stopped,
    /// Finished with an error.
    Failed,
    /// Finished successfully.
    Succeeded,
}

impl PipelineExecutionStatus {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "Executing",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
        }
    }

    /// Returns true if the execution can no longer change status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Succeeded)
    }
}

impl fmt::Display for PipelineExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "executing" => Ok(Self::Executing),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            other => Err(format!("unknown pipeline execution status '{other}'")),
        }
    }
}

/// Which success-event shape the deploy rule subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventSchema {
    /// The documented shape: `currentPipelineExecutionStatus` plus a
    /// `pipelineArn` suffix match.
    #[default]
    StatusChange,
    /// Earlier revisions' predicate on a `pipelineName` field. The service
    /// does not emit that field, so rules using it never fire.
    PipelineNameField,
}

impl PipelineEventSchema {
    /// Builds the pattern that matches a successful execution of `pipeline_name`.
    #[must_use]
    pub fn success_pattern(&self, pipeline_name: &str) -> EventPattern {
        let detail = match self {
            Self::StatusChange => json!({
                "currentPipelineExecutionStatus": [PipelineExecutionStatus::Succeeded.as_str()],
                "pipelineArn": [{ "suffix": pipeline_arn_suffix(pipeline_name) }],
            }),
            Self::PipelineNameField => json!({
                "pipelineName": [pipeline_name],
                "currentPipelineExecutionStatus": [PipelineExecutionStatus::Succeeded.as_str()],
            }),
        };
        EventPattern(
            json!({
                "source": [SAGEMAKER_SOURCE],
                "detail-type": [PIPELINE_STATUS_CHANGE],
                "detail": detail,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        )
    }

    /// Returns true if this schema matches what the service actually emits.
    #[must_use]
    pub fn is_documented(&self) -> bool {
        matches!(self, Self::StatusChange)
    }
}

/// Suffix every ARN of the named pipeline ends with.
#[must_use]
pub fn pipeline_arn_suffix(pipeline_name: &str) -> String {
    format!(":pipeline/{}", pipeline_name.to_ascii_lowercase())
}

/// Concrete pipeline ARN.
#[must_use]
pub fn pipeline_arn(partition: &str, region: &str, account: &str, pipeline_name: &str) -> String {
    format!(
        "arn:{partition}:sagemaker:{region}:{account}{}",
        pipeline_arn_suffix(pipeline_name)
    )
}

/// Pipeline ARN resolved at deploy time.
#[must_use]
pub fn pipeline_arn_expr(pipeline_name: &str) -> Expr {
    Expr::sub(format!(
        "arn:${{AWS::Partition}}:sagemaker:${{AWS::Region}}:${{AWS::AccountId}}{}",
        pipeline_arn_suffix(pipeline_name)
    ))
}

/// Fields of one status-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatusChange {
    /// Event ID.
    pub id: String,
    /// Emitting account.
    pub account: String,
    /// Emitting region.
    pub region: String,
    /// Event time (`2024-01-01T00:00:00Z`).
    pub time: String,
    /// Pipeline ARN.
    pub pipeline_arn: String,
    /// Execution ARN.
    pub execution_arn: String,
    /// Status before the change.
    pub previous: PipelineExecutionStatus,
    /// Status after the change.
    pub current: PipelineExecutionStatus,
}

impl PipelineStatusChange {
    /// Renders the event in the shape the service emits.
    #[must_use]
    pub fn to_event(&self) -> Value {
        let display_name = self
            .execution_arn
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        json!({
            "version": "0",
            "id": self.id,
            "detail-type": PIPELINE_STATUS_CHANGE,
            "source": SAGEMAKER_SOURCE,
            "account": self.account,
            "time": self.time,
            "region": self.region,
            "resources": [self.pipeline_arn, self.execution_arn],
            "detail": {
                "pipelineExecutionDisplayName": display_name,
                "currentPipelineExecutionStatus": self.current.as_str(),
                "previousPipelineExecutionStatus": self.previous.as_str(),
                "executionStartTime": self.time,
                "executionEndTime": self.time,
                "pipelineArn": self.pipeline_arn,
                "pipelineExecutionArn": self.execution_arn,
            }
        })
    }
}
