//! Render jobs and their lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::protocol::RenderRequest;
use crate::target::{OutputFormat, RenderTargetSpec};
use crate::JobFailure;

/// Prefix of every result store key
pub const RESULT_KEY_PREFIX: &str = "snapshot:";

/// Job identifier: a freshly generated artifact filename such as
/// `6f1c...e2.png`. Never reused, so result keys never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a unique filename for the given format
    pub fn generate(format: OutputFormat) -> Self {
        JobId(format!("{}.{}", Uuid::new_v4(), format.extension()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key the rendered artifact is published under
    pub fn result_key(&self) -> String {
        result_key(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result store key for an artifact filename; only the base name is used
pub fn result_key(filename: &str) -> String {
    let base = filename.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(filename);
    format!("{}{}", RESULT_KEY_PREFIX, base)
}

/// One request to render a target into an artifact. Immutable once built.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub id: JobId,
    /// Absolute URL, already restricted to the service origin
    pub url: String,
    pub format: OutputFormat,
    pub target: RenderTargetSpec,
    /// Id of the element to clip to
    pub selector: Option<String>,
    /// Bearer credential forwarded to the rendered page
    pub credential: String,
    /// Who asked, for logs
    pub caller: Option<String>,
    pub submitted_at: SystemTime,
}

impl RenderJob {
    pub fn new(
        url: impl Into<String>,
        format: OutputFormat,
        target: RenderTargetSpec,
        selector: Option<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::generate(format),
            url: url.into(),
            format,
            target,
            selector,
            credential: credential.into(),
            caller: None,
            submitted_at: SystemTime::now(),
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// What a worker needs to run this job
    pub fn to_request(&self) -> RenderRequest {
        RenderRequest {
            job_id: self.id.clone(),
            url: self.url.clone(),
            format: self.format,
            target: self.target.clone(),
            selector: self.selector.clone(),
            credential: self.credential.clone(),
        }
    }
}

/// Lifecycle of a job: `Queued → Assigned → Rendering → Completed | Failed | TimedOut`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Assigned,
    Rendering,
    Completed,
    Failed(JobFailure),
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed(_) | JobState::TimedOut
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Rendering => write!(f, "rendering"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed(failure) => write!(f, "failed ({})", failure),
            JobState::TimedOut => write!(f, "timed out"),
        }
    }
}
