//! mlp-forge: active-learning loop orchestrator.
//!
//! Drives iterations of label, train, explore, select and update across
//! parallel branches, submitting the work of each stage to an executor as
//! retried, gathered jobs.

pub mod artifact;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod resource;
pub mod script;
pub mod stage;
pub mod workflow;

pub use error::{ConfigError, ExecutorError, JobError, ResourceError, StageError, WorkflowError};
