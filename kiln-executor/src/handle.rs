//! VM handle — exclusive ownership of one warm microVM.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use kiln_core::VmId;

use crate::machine::Machine;

/// The worker's owning reference to one live VM plus its disposal
/// obligations.
///
/// Dropping a handle does NOT stop the VM; call [`VmHandle::dispose`]
/// explicitly. A handle's artifacts (rootfs copy, control socket) are
/// cleaned up exactly once, by whoever holds it when it is done.
#[derive(Debug)]
#[non_exhaustive]
pub struct VmHandle {
    /// Unique identifier for this VM instance.
    pub id: VmId,

    /// Guest IPv4 address, reachable from the worker.
    pub ip: Ipv4Addr,

    /// Per-VM writable rootfs copy.
    pub rootfs_path: PathBuf,

    /// Per-VM hypervisor control socket.
    pub socket_path: PathBuf,

    /// The running hypervisor process.
    pub machine: Machine,

    /// Fires to terminate the hypervisor; becomes ready no later than the
    /// hypervisor's own exit.
    pub cancel: CancellationToken,

    /// Timestamp when the VM was created.
    pub created_at: DateTime<Utc>,
}

impl VmHandle {
    /// Wrap a freshly launched machine.
    #[must_use]
    pub fn new(id: VmId, rootfs_path: PathBuf, socket_path: PathBuf, machine: Machine) -> Self {
        let ip = machine.ip();
        let cancel = machine.cancel_token();
        Self {
            id,
            ip,
            rootfs_path,
            socket_path,
            machine,
            cancel,
            created_at: Utc::now(),
        }
    }

    /// Shut the VM down and remove its on-disk artifacts.
    ///
    /// Removal errors are logged, never propagated: at this point the job
    /// outcome is already decided and the janitor catches stragglers.
    pub async fn dispose(self) {
        self.machine.shutdown().await;

        if let Err(e) = tokio::fs::remove_file(&self.rootfs_path).await {
            tracing::error!(vm_id = %self.id, error = %e, "failed to delete rootfs copy");
        }
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            tracing::error!(vm_id = %self.id, error = %e, "failed to delete control socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::cni::GuestNetwork;

    fn test_machine() -> Machine {
        let child = match tokio::process::Command::new("sleep").arg("600").spawn() {
            Ok(c) => c,
            Err(e) => panic!("failed to spawn sleep: {e}"),
        };
        Machine::supervise(
            VmId::new(),
            PathBuf::from("/tmp/kiln-handle-test.sock"),
            GuestNetwork {
                netns: "kiln-test".to_owned(),
                tap_device: "tap0".to_owned(),
                ip: Ipv4Addr::new(10, 61, 0, 9),
                prefix_len: 24,
                gateway: Ipv4Addr::new(10, 61, 0, 1),
            },
            None,
            child,
            tokio_util::sync::CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn handle_adopts_machine_identity() {
        let machine = test_machine();
        let handle = VmHandle::new(
            VmId::new(),
            PathBuf::from("/tmp/r.ext4"),
            PathBuf::from("/tmp/s.sock"),
            machine,
        );
        assert_eq!(handle.ip, Ipv4Addr::new(10, 61, 0, 9));
        handle.dispose().await;
    }

    #[tokio::test]
    async fn dispose_removes_artifacts_and_stops_the_machine() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let rootfs = dir.path().join("python_fs_image.ext4-x.ext4");
        let socket = dir.path().join("firecracker-x.sock");
        if let Err(e) = std::fs::write(&rootfs, b"fs") {
            panic!("write failed: {e}");
        }
        if let Err(e) = std::fs::write(&socket, b"") {
            panic!("write failed: {e}");
        }

        let machine = test_machine();
        let watcher = machine.clone();
        let handle = VmHandle::new(VmId::new(), rootfs.clone(), socket.clone(), machine);

        handle.dispose().await;

        assert!(!rootfs.exists(), "rootfs copy must be removed");
        assert!(!socket.exists(), "control socket must be removed");
        // The hypervisor process is gone too.
        let waited =
            tokio::time::timeout(std::time::Duration::from_secs(1), watcher.wait()).await;
        assert!(waited.is_ok(), "machine must have exited after dispose");
    }
}
