//! Error taxonomy for the pipeline
//!
//! Only `TransientCallFailure` is ever retried. Everything else either
//! fails a single round/verification (and is surfaced through the
//! orchestration policy) or aborts a stage.

use crate::types::DialogId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network error, timeout, rate limit or server-side failure
    #[error("transient model call failure: {0}")]
    TransientCallFailure(String),

    /// The endpoint refused the request (auth, bad request, ...)
    #[error("model rejected request (status {status}): {body}")]
    ModelRejected { status: u16, body: String },

    /// Model output does not match the expected schema
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("incomplete samples: expected {expected} raw judgments, got {got}")]
    IncompleteSamples { expected: usize, got: usize },

    #[error("unexpected sample count: expected {expected} raw judgments, got {got}")]
    UnexpectedSampleCount { expected: usize, got: usize },

    #[error("verification unavailable: {0}")]
    VerificationUnavailable(String),

    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    /// Stage input exists but is not the expected file format
    #[error("invalid input file {}: {reason}", .path.display())]
    InvalidInput { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("record for dialog {0} already written")]
    DuplicateRecord(DialogId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether a retry could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientCallFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
