//! Boot-health gate — decides whether a freshly started VM is usable.

use std::net::Ipv4Addr;
use std::time::Duration;

use kiln_core::VmId;

use crate::ExecutorError;

/// Polls the in-guest agent's liveness endpoint until it answers 200 or the
/// boot deadline expires. Transport errors and non-200 statuses are treated
/// identically: not ready yet, retry.
#[derive(Debug, Clone)]
pub struct BootGate {
    client: reqwest::Client,
    agent_port: u16,
    retry_interval: Duration,
}

impl BootGate {
    /// Create a gate polling `http://<ip>:<agent_port>/` every
    /// `retry_interval`.
    #[must_use]
    pub fn new(agent_port: u16, retry_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            agent_port,
            retry_interval,
        }
    }

    /// Wait for the agent to answer its first 200.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BootTimeout`] if `deadline` elapses first.
    pub async fn wait_for_agent(
        &self,
        vm_id: VmId,
        ip: Ipv4Addr,
        deadline: Duration,
    ) -> Result<(), ExecutorError> {
        let endpoint = format!("http://{ip}:{}/", self.agent_port);

        let poll = async {
            loop {
                match self.client.get(&endpoint).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        // Always drain the body, whatever the status.
                        let _ = resp.bytes().await;
                        if status == reqwest::StatusCode::OK {
                            tracing::info!(vm_id = %vm_id, %ip, "VM agent ready");
                            return;
                        }
                        tracing::debug!(vm_id = %vm_id, %status, "VM not ready yet");
                    }
                    Err(e) => {
                        tracing::debug!(vm_id = %vm_id, error = %e, "VM not reachable yet");
                    }
                }
                tokio::time::sleep(self.retry_interval).await;
            }
        };

        tokio::time::timeout(deadline, poll)
            .await
            .map_err(|_| ExecutorError::BootTimeout {
                vm_id,
                deadline_ms: deadline.as_millis(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn gate_times_out_against_a_dead_address() {
        let gate = BootGate::new(1, Duration::from_millis(10));
        // Port 1 on loopback: connection refused, forever.
        let result = gate
            .wait_for_agent(VmId::new(), Ipv4Addr::LOCALHOST, Duration::from_millis(100))
            .await;
        assert!(
            matches!(result, Err(ExecutorError::BootTimeout { .. })),
            "unreachable agent must time out"
        );
    }

    #[tokio::test]
    async fn gate_passes_once_agent_answers_200() {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        let port = match listener.local_addr() {
            Ok(a) => a.port(),
            Err(e) => panic!("local_addr failed: {e}"),
        };

        // Minimal agent: answer every connection with a bare 200.
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok",
                        )
                        .await;
                });
            }
        });

        let gate = BootGate::new(port, Duration::from_millis(10));
        let result = gate
            .wait_for_agent(VmId::new(), Ipv4Addr::LOCALHOST, Duration::from_secs(5))
            .await;
        assert!(result.is_ok(), "gate must pass once the agent answers 200");
    }
}
