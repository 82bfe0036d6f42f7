//! Error types for the worker crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use kiln_core::JobResponse;

/// Failure kinds surfaced by the job pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The request body failed validation; no VM was claimed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A declared source job has no state archive in the store.
    #[error("unknown source job '{0}': no state archive for it")]
    MissingSource(String),

    /// The agent answered non-200; its stderr still reaches the caller.
    #[error("agent failure (context: {context}): {message}")]
    AgentFailure { message: String, context: String },

    /// Connection-level failure talking to the guest.
    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent's response body was not the expected JSON envelope.
    #[error("agent response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The agent succeeded but its state archive could not be saved.
    #[error("state archive persist failed: {0}")]
    StatePersist(String),

    /// The warm pool shut down while a job was waiting.
    #[error("warm pool closed")]
    PoolClosed,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether this failure is the caller's fault (maps to 400).
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            WorkerError::InvalidRequest(_) | WorkerError::MissingSource(_)
        )
    }
}

/// A failed job: the error plus whatever partial client response the agent
/// managed to produce, so the caller still sees the guest's stderr.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct JobFailure {
    pub error: WorkerError,
    pub response: JobResponse,
}

impl JobFailure {
    /// A failure with no client response attached.
    #[must_use]
    pub fn bare(error: WorkerError) -> Self {
        Self {
            error,
            response: JobResponse::default(),
        }
    }

    /// A failure carrying the agent's (possibly partial) client response.
    #[must_use]
    pub fn with_response(error: WorkerError, response: JobResponse) -> Self {
        Self { error, response }
    }
}

impl From<WorkerError> for JobFailure {
    fn from(error: WorkerError) -> Self {
        Self::bare(error)
    }
}

impl IntoResponse for JobFailure {
    fn into_response(self) -> Response {
        if self.error.is_bad_request() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"message": self.error.to_string()})),
            )
                .into_response();
        }
        // Execution failures answer 500 with the captured stdout/stderr as
        // the body, matching what the client would see on success.
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self.response)).into_response()
    }
}
