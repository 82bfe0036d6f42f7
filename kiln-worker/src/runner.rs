//! Per-job execution against one claimed microVM.
//!
//! Lifecycle of a job: validate, claim a warm VM, ship the code and any
//! source-state archives to the in-guest agent, pull the new state archive
//! back, and dispose of the VM. Disposal runs on every path, exactly once,
//! and the handle's cancellation token fires no later than hypervisor
//! death.

use std::sync::Arc;

use reqwest::multipart;

use kiln_core::{AgentRunResponse, JobRequest, JobResponse};
use kiln_executor::{VmHandle, VmPool};

use crate::error::{JobFailure, WorkerError};
use crate::store::StateStore;

/// Runs jobs by claiming VMs from the warm pool.
///
/// No retries: the first failure surfaces to the caller, who may resubmit.
#[derive(Debug)]
pub struct JobRunner {
    pool: Arc<VmPool>,
    store: StateStore,
    http: reqwest::Client,
    agent_port: u16,
}

impl JobRunner {
    /// Create a runner over the given pool and store.
    #[must_use]
    pub fn new(pool: Arc<VmPool>, store: StateStore, agent_port: u16) -> Self {
        Self {
            pool,
            store,
            http: reqwest::Client::new(),
            agent_port,
        }
    }

    /// Execute one job to completion.
    ///
    /// Blocks while the pool is empty; that latency is the intended
    /// backpressure, not an error.
    ///
    /// # Errors
    /// Validation failures are reported without claiming a VM. Execution
    /// failures carry whatever partial client response the agent produced.
    pub async fn run(&self, req: &JobRequest) -> Result<JobResponse, JobFailure> {
        self.validate(req).await?;

        let vm = self
            .pool
            .claim()
            .await
            .ok_or_else(|| JobFailure::bare(WorkerError::PoolClosed))?;

        tracing::info!(job_id = %req.id, vm_id = %vm.id, ip = %vm.ip, "claimed VM for job");

        // The cancel token must become ready no later than VM death, so
        // nothing stays blocked on a machine that already exited.
        let machine = vm.machine.clone();
        let cancel = vm.cancel.clone();
        tokio::spawn(async move {
            machine.wait().await;
            cancel.cancel();
        });

        let outcome = self.execute(&vm, req).await;
        vm.dispose().await;

        if let Err(failure) = &outcome {
            tracing::error!(job_id = %req.id, error = %failure, "job failed");
        } else {
            tracing::info!(job_id = %req.id, "job complete");
        }
        outcome
    }

    /// Preconditions, checked before any VM is claimed.
    async fn validate(&self, req: &JobRequest) -> Result<(), JobFailure> {
        if req.id.trim().is_empty() {
            return Err(WorkerError::InvalidRequest("job id must not be empty".to_owned()).into());
        }
        for source_id in &req.source_ids {
            if !self.store.contains(source_id).await {
                return Err(WorkerError::MissingSource(source_id.clone()).into());
            }
        }
        Ok(())
    }

    async fn execute(&self, vm: &VmHandle, req: &JobRequest) -> Result<JobResponse, JobFailure> {
        // Multipart body: id and code as text fields, then one file part
        // per source archive, in the order the request listed them.
        let mut form = multipart::Form::new()
            .text("id", req.id.clone())
            .text("code", req.code.clone());
        for source_id in &req.source_ids {
            let bytes = self.store.read(source_id).await.map_err(JobFailure::bare)?;
            let part = multipart::Part::bytes(bytes).file_name(StateStore::archive_name(source_id));
            form = form.part("stateFiles", part);
        }

        let run_url = format!("http://{}:{}/run", vm.ip, self.agent_port);
        let resp = self
            .http
            .post(&run_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| JobFailure::bare(WorkerError::Transport(e)))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| JobFailure::bare(WorkerError::Transport(e)))?;

        let envelope: AgentRunResponse = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Salvage the clientResponse field if the rest of the
                // envelope is garbage, so stderr still reaches the caller.
                return Err(JobFailure::with_response(
                    WorkerError::Decode(e),
                    partial_client_response(&body),
                ));
            }
        };

        if status != reqwest::StatusCode::OK {
            return Err(JobFailure::with_response(
                WorkerError::AgentFailure {
                    message: envelope.error.message,
                    context: envelope.error.context,
                },
                envelope.client_response,
            ));
        }

        let state_resp = self
            .http
            .get(&envelope.state_file_endpoint)
            .send()
            .await
            .map_err(|e| {
                JobFailure::with_response(
                    WorkerError::Transport(e),
                    envelope.client_response.clone(),
                )
            })?;
        if state_resp.status() != reqwest::StatusCode::OK {
            return Err(JobFailure::with_response(
                WorkerError::StatePersist(format!(
                    "state endpoint {} answered {}",
                    envelope.state_file_endpoint,
                    state_resp.status()
                )),
                envelope.client_response,
            ));
        }

        self.store
            .put(&envelope.state_file, state_resp)
            .await
            .map_err(|e| JobFailure::with_response(e, envelope.client_response.clone()))?;

        tracing::debug!(job_id = %req.id, archive = %envelope.state_file, "state archive persisted");

        Ok(envelope.client_response)
    }
}

/// Best-effort extraction of `clientResponse` from a malformed envelope.
fn partial_client_response(body: &[u8]) -> JobResponse {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("clientResponse").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
