//! Wire format between the dispatcher and a worker unit
//!
//! One JSON document per line in each direction. The dispatcher writes
//! [`WorkerRequest`]s to the worker's stdin; the worker answers on stdout with
//! [`WorkerReply`]s. Artifacts travel base64 encoded together with a SHA-256
//! digest so a truncated or garbled payload is never published.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::JobId;
use crate::target::{OutputFormat, RenderTargetSpec};
use crate::{FailureReason, JobFailure, Result};

/// Everything a worker needs to run one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub job_id: JobId,
    pub url: String,
    pub format: OutputFormat,
    pub target: RenderTargetSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub credential: String,
}

/// Dispatcher → worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Render(RenderRequest),
    /// Finish in-flight jobs, then exit
    Shutdown,
}

/// Worker → dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The engine is up and the worker accepts jobs
    Ready { pid: u32 },
    /// A page was opened for the job
    Started { job_id: JobId },
    Finished { job_id: JobId, outcome: WireOutcome },
}

/// How one job ended inside the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Rendered { data: String, sha256: String },
    Failed { failure: JobFailure },
}

impl WireOutcome {
    pub fn from_result(result: std::result::Result<Vec<u8>, JobFailure>) -> Self {
        match result {
            Ok(bytes) => WireOutcome::Rendered {
                sha256: digest(&bytes),
                data: general_purpose::STANDARD.encode(&bytes),
            },
            Err(failure) => WireOutcome::Failed { failure },
        }
    }

    /// Decode the artifact, checking it against its digest
    pub fn into_result(self) -> std::result::Result<Bytes, JobFailure> {
        match self {
            WireOutcome::Failed { failure } => Err(failure),
            WireOutcome::Rendered { data, sha256 } => {
                let bytes = general_purpose::STANDARD.decode(data.as_bytes()).map_err(|e| {
                    JobFailure::new(FailureReason::RenderFailed, format!("undecodable artifact: {}", e))
                })?;
                if !digest(&bytes).eq_ignore_ascii_case(&sha256) {
                    return Err(JobFailure::new(
                        FailureReason::RenderFailed,
                        "artifact digest mismatch",
                    ));
                }
                Ok(Bytes::from(bytes))
            }
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serialize one message as a newline-terminated line
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line received from the other side
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
