//! Running hypervisor process supervision.
//!
//! A [`Machine`] is a cheap, cloneable view onto one hypervisor process.
//! The process itself is owned by a supervisor task that selects between
//! natural exit and the machine's cancellation token; either way the exit is
//! published on a watch channel, so any number of tasks can block on
//! [`Machine::wait`] without sharing the child.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kiln_core::VmId;

use crate::cni::{CniNetwork, GuestNetwork};

/// Handle to a running hypervisor process.
///
/// Cancelling the token kills the process; the supervisor tears the CNI
/// attachment down after the process is gone, exactly once.
#[derive(Debug, Clone)]
pub struct Machine {
    vm_id: VmId,
    socket_path: PathBuf,
    network: GuestNetwork,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl Machine {
    /// Take ownership of a spawned hypervisor child and start supervising it.
    ///
    /// `cni` is the network the guest was attached through; pass `None` for
    /// machines whose namespace is managed elsewhere (tests use this with a
    /// plain child process).
    #[must_use]
    pub fn supervise(
        vm_id: VmId,
        socket_path: PathBuf,
        network: GuestNetwork,
        cni: Option<CniNetwork>,
        mut child: Child,
        cancel: CancellationToken,
    ) -> Self {
        let (exit_tx, exited) = watch::channel(false);

        let supervisor_cancel = cancel.clone();
        let supervisor_network = network.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            tracing::info!(vm_id = %vm_id, %status, "hypervisor exited");
                        }
                        Err(e) => {
                            tracing::error!(vm_id = %vm_id, error = %e, "hypervisor wait failed");
                        }
                    }
                }
                () = supervisor_cancel.cancelled() => {
                    tracing::debug!(vm_id = %vm_id, "cancel fired, killing hypervisor");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(vm_id = %vm_id, error = %e, "hypervisor kill failed");
                    }
                }
            }

            if let Some(cni) = cni {
                if let Err(reason) = cni.detach(&supervisor_network).await {
                    tracing::warn!(vm_id = %vm_id, %reason, "network detach failed");
                }
            }

            let _ = exit_tx.send(true);
        });

        Self {
            vm_id,
            socket_path,
            network,
            cancel,
            exited,
        }
    }

    /// The VM this machine backs.
    #[must_use]
    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Path of the hypervisor's control socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Guest IPv4 address.
    #[must_use]
    pub fn ip(&self) -> Ipv4Addr {
        self.network.ip
    }

    /// The guest's network attachment.
    #[must_use]
    pub fn network(&self) -> &GuestNetwork {
        &self.network
    }

    /// Token that, when cancelled, terminates the hypervisor process.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the hypervisor process has exited and its network
    /// attachment is torn down.
    pub async fn wait(&self) {
        let mut exited = self.exited.clone();
        while !*exited.borrow_and_update() {
            if exited.changed().await.is_err() {
                return;
            }
        }
    }

    /// Request shutdown and wait for the exit to be observed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;

    fn loopback_network() -> GuestNetwork {
        GuestNetwork {
            netns: "kiln-test".to_owned(),
            tap_device: "tap0".to_owned(),
            ip: Ipv4Addr::LOCALHOST,
            prefix_len: 8,
            gateway: Ipv4Addr::LOCALHOST,
        }
    }

    fn spawn_child(program: &str, args: &[&str]) -> Child {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        match cmd.spawn() {
            Ok(c) => c,
            Err(e) => panic!("failed to spawn {program}: {e}"),
        }
    }

    #[tokio::test]
    async fn wait_observes_natural_exit() {
        let child = spawn_child("true", &[]);
        let machine = Machine::supervise(
            VmId::new(),
            PathBuf::from("/tmp/test.sock"),
            loopback_network(),
            None,
            child,
            CancellationToken::new(),
        );

        let waited = tokio::time::timeout(Duration::from_secs(5), machine.wait()).await;
        assert!(waited.is_ok(), "wait must complete once the process exits");
    }

    #[tokio::test]
    async fn cancel_kills_a_long_running_process() {
        let child = spawn_child("sleep", &["600"]);
        let cancel = CancellationToken::new();
        let machine = Machine::supervise(
            VmId::new(),
            PathBuf::from("/tmp/test.sock"),
            loopback_network(),
            None,
            child,
            cancel.clone(),
        );

        cancel.cancel();
        let waited = tokio::time::timeout(Duration::from_secs(5), machine.wait()).await;
        assert!(waited.is_ok(), "cancel must terminate the process promptly");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_across_clones() {
        let child = spawn_child("sleep", &["600"]);
        let machine = Machine::supervise(
            VmId::new(),
            PathBuf::from("/tmp/test.sock"),
            loopback_network(),
            None,
            child,
            CancellationToken::new(),
        );

        let clone = machine.clone();
        machine.shutdown().await;
        // A second shutdown through a clone must return immediately.
        let again = tokio::time::timeout(Duration::from_secs(1), clone.shutdown()).await;
        assert!(again.is_ok(), "repeat shutdown must not block");
    }
}
