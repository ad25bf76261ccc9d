//! Error types for the rendering cluster

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::job::JobId;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while accepting, running or collecting a render
#[derive(Error, Debug)]
pub enum Error {
    /// The requested size string does not describe a usable render target.
    /// Raised before anything is queued.
    #[error("Invalid render spec: {0}")]
    InvalidRenderSpec(String),

    /// The job reached a `Failed` terminal state
    #[error(transparent)]
    Job(#[from] JobFailure),

    /// The caller's deadline elapsed before the job finished
    #[error("Render timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// A completed job had no blob in the result store at collection time
    #[error("Rendered artifact {0} is missing from the result store")]
    ArtifactMissing(String),

    /// Admission limit reached
    #[error("Render queue is full ({0} jobs waiting)")]
    Rejected(usize),

    /// The cluster has been stopped and accepts no more work
    #[error("Render cluster is stopped")]
    ClusterStopped,

    /// A job with the same id is already tracked
    #[error("Duplicate job id {0}")]
    DuplicateJob(JobId),

    /// Worker id outside the pool
    #[error("Unknown worker {0}")]
    UnknownWorker(usize),

    /// Failed to initialize the rendering engine
    #[error("Engine initialization failed: {0}")]
    InitializationError(String),

    /// Failed to load a URL
    #[error("Failed to load URL: {0}")]
    LoadError(String),

    /// Failed to render content
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Failed to execute JavaScript in the page
    #[error("Script execution failed: {0}")]
    ScriptError(String),

    /// Malformed message on a worker link
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    CdpError(String),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::CdpError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err.to_string())
    }
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The page could not be opened
    OpenFailed,
    /// The clip selector matched no element
    ClipTargetNotFound,
    /// The engine produced no bytes
    RenderFailed,
    /// The worker running the job exited
    WorkerLost,
    /// The cluster was stopped while the job was pending
    ClusterStopped,
    /// The artifact could not be written to the result store
    PublishFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureReason::OpenFailed => "open failed",
            FailureReason::ClipTargetNotFound => "clip target not found",
            FailureReason::RenderFailed => "render failed",
            FailureReason::WorkerLost => "worker lost",
            FailureReason::ClusterStopped => "cluster stopped",
            FailureReason::PublishFailed => "publish failed",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a single job, as reported to the waiting caller
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}
