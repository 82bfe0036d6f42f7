//! Wire types for job submission and the in-guest agent protocol.

use serde::{Deserialize, Serialize};

/// A request to run one code cell in a fresh sandbox.
///
/// `id` is a client-supplied unique token; the resulting state archive is
/// stored under `<id>_state.tgz`. Each entry of `source_ids` names a prior
/// job whose archived interpreter state is restored before the cell runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub code: String,
    #[serde(rename = "sourceIds", default)]
    pub source_ids: Vec<String>,
}

/// Captured stdout/stderr handed back to the submitting client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    /// Guest stdout.
    pub result: String,
    /// Guest stderr; empty on success.
    pub error: String,
}

/// Failure detail reported by the agent alongside a non-200 status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFault {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: String,
}

/// Envelope returned by the agent's `POST /run`.
///
/// On success `state_file_endpoint` points at the freshly serialized state
/// archive and `state_file` carries the filename the worker should store it
/// under. On failure only `client_response` and `error` are meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunResponse {
    #[serde(default)]
    pub client_response: JobResponse,
    #[serde(default)]
    pub error: AgentFault,
    #[serde(default)]
    pub state_file_endpoint: String,
    #[serde(default)]
    pub state_file: String,
}
