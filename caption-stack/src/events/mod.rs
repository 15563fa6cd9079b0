//! Event contracts: bus patterns, pipeline status changes, bucket
//! notifications and control-plane activity sinks.

mod pattern;
mod schema;
pub mod sink;
mod storage;

pub use pattern::{EventPattern, PatternError};
pub use schema::{
    pipeline_arn, pipeline_arn_expr, pipeline_arn_suffix, PipelineEventSchema, PipelineExecutionStatus,
    PipelineStatusChange, PIPELINE_STATUS_CHANGE, SAGEMAKER_SOURCE,
};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
pub use storage::{object_event_record, KeyFilter, NotificationFilter, S3EventType};
