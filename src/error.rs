//! Error types for mlp-forge operations.
//!
//! Defines error types for every subsystem of the orchestrator:
//! - Configuration loading and validation
//! - Artifact and executor resolution
//! - Executor workspace and process management
//! - Job completion, retry exhaustion and gathering
//! - Stage execution
//! - The iteration engine

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Executor '{0}' is not found in the configuration")]
    UnknownExecutor(String),

    #[error("path_prefix should not be empty")]
    EmptyPathPrefix,

    #[error("No configuration files were given")]
    NoConfigFiles,

    #[error("Failed to read configuration file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid {section} configuration: {message}")]
    Schema { section: String, message: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    /// Shorthand for a schema violation in the given section.
    pub fn schema(section: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Schema {
            section: section.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while resolving named resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Artifact '{0}' not found in catalog")]
    ArtifactNotFound(String),

    #[error("Executor '{0}' is not registered")]
    ExecutorNotFound(String),
}

/// Errors raised by an executor backend.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to create workspace directory '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch job in '{cwd}': {source}")]
    Spawn {
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job_id} could not be awaited: {message}")]
    Wait { job_id: Uuid, message: String },

    #[error("Function failed on executor '{executor}': {message}")]
    Function { executor: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by jobs and gathered job groups.
#[derive(Debug, Error)]
pub enum JobError {
    /// A unit of work still failed after every allowed attempt.
    #[error("Job {job_id} in '{cwd}' failed after {attempts} attempt(s) (exit code {exit_code:?})")]
    Failed {
        job_id: Uuid,
        cwd: PathBuf,
        attempts: u32,
        exit_code: Option<i32>,
    },

    /// First permanent failure of a gather configured to raise.
    #[error("Gathered job {index} of {total} failed: {first}")]
    Aggregate {
        index: usize,
        total: usize,
        #[source]
        first: Box<JobError>,
    },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Errors raised while executing a stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Unsupported format '{format}' for dataset '{url}'")]
    UnsupportedFormat { url: String, format: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Invalid stage input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the iteration engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Iteration {iteration}: {stage} stage failed for '{scope}': {source}")]
    Stage {
        iteration: usize,
        stage: &'static str,
        scope: String,
        #[source]
        source: StageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
