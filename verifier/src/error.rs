//! Typed errors the engine branches on.
//!
//! Everything else flows through `anyhow` with context.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A checkpoint could not be executed at all.
///
/// Distinct from tests failing: the executor records a null result and stops
/// the remaining checkpoints of the candidate.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("run timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("no test workflows found")]
    NoWorkflows,

    #[error("ci runner error: {0}")]
    Runner(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InfraError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Git { .. } => "git",
            Self::Spawn { .. } => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::NoWorkflows => "no_workflows",
            Self::Runner(_) => "runner",
            Self::Io(_) => "io",
        }
    }
}

/// A patch did not apply cleanly.
#[derive(Debug, Error)]
#[error("patch does not apply to {}: {stderr}", files.join(", "))]
pub struct ApplyError {
    /// Files `git apply` reported as failing.
    pub files: Vec<String>,
    pub stderr: String,
}

/// Failure of a metadata-service call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exhausted until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("every credential's {class} limit is below the margin of {margin}")]
    NoHeadroom { class: &'static str, margin: u32 },
}
