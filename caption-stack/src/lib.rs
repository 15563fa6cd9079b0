//! # Caption Stack
//!
//! A typed deployment topology for an image-captioning inference service.
//!
//! The topology is declared as a graph of typed resources and validated
//! while it is built:
//!
//! - **Network**: a two-zone VPC with public and private subnets, NAT
//!   egress and an S3 gateway endpoint
//! - **Inference**: model, endpoint configuration and endpoint with full
//!   data capture, created in that order
//! - **Automation**: an ingest bucket whose uploads start the training
//!   pipeline, and an event rule that redeploys the newest model when the
//!   pipeline succeeds
//! - **Least privilege**: every role is checked for wildcard actions and
//!   unconditioned `iam:PassRole`
//!
//! The validated stack renders as a CloudFormation template. With the
//! `simulation` feature it can also be deployed into an in-memory control
//! plane that delivers uploads and bus events to function handlers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use caption_stack::prelude::*;
//!
//! let config = StackConfig::load("caption-stack.toml")?;
//! let stack = CaptionTopology::new(config).synthesize()?;
//! println!("{}", stack.to_json_pretty()?);
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod observability;
pub mod resources;
pub mod stack;
pub mod template;
pub mod topology;
pub mod utils;

#[cfg(feature = "simulation")]
pub mod simulation;

#[cfg(feature = "simulation")]
pub mod testing;

pub use config::StackConfig;
pub use errors::{CloudError, StackError, SynthResult, SynthesisError};
pub use stack::{Stack, StackBuilder};
pub use topology::{synthesize, CaptionTopology, TopologyVariant};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::StackConfig;
    pub use crate::core::{Expr, Resolver};
    pub use crate::errors::{
        CloudError, ConfigError, CycleDetectedError, ErrorInfo, StackError, SynthResult, SynthesisError,
    };
    pub use crate::events::{
        CollectingEventSink, EventPattern, EventSink, LoggingEventSink, NoOpEventSink, PipelineEventSchema,
        PipelineExecutionStatus,
    };
    pub use crate::lifecycle::{plan, ChangeAction, ChangeSet, EndpointLifecycle};
    pub use crate::network::{analyze_routing, NetworkSpec};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::stack::{Stack, StackBuilder};
    pub use crate::template::{types, DeletionPolicy, Resource, Template};
    pub use crate::topology::{ids, CaptionTopology, TopologyVariant};

    #[cfg(feature = "simulation")]
    pub use crate::simulation::{
        CloudEnvironment, ControlPlane, DeployLatestModel, FunctionHandler, Invocation, TriggerPipeline,
    };
}
