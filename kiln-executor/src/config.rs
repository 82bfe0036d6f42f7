//! VMM and warm-pool configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_core::VmId;

/// Default guest agent port; the boot-health gate and the job runner both
/// talk to `http://<vm-ip>:<agent_port>`.
pub const AGENT_PORT_DEFAULT: u16 = 1323;

/// Default warm-pool capacity.
pub const POOL_CAPACITY_DEFAULT: usize = 5;

/// Default interval between pool-filler ticks and health-poll retries.
pub const RETRY_INTERVAL_DEFAULT: Duration = Duration::from_millis(100);

/// Default deadline for a fresh VM's agent to answer its first 200.
pub const BOOT_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Configuration for launching Firecracker microVMs.
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Path to the `firecracker` binary.
    pub firecracker_bin: PathBuf,

    /// Path to the guest kernel image.
    pub kernel_image: PathBuf,

    /// Read-only rootfs template; each VM gets a writable full copy.
    pub rootfs_template: PathBuf,

    /// Kernel command line. A CNI-assigned `ip=` clause is appended at launch.
    pub boot_args: String,

    /// Name of the CNI network the VM's tap interface is attached through.
    pub cni_network: String,

    /// Interface name requested from the CNI plugin chain.
    pub cni_ifname: String,

    /// Directory holding the CNI plugin binaries (`CNI_PATH`).
    pub cni_bin_dir: PathBuf,

    /// Directory holding the CNI network configuration (`NETCONFPATH`).
    pub cni_conf_dir: PathBuf,

    /// Filename prefix for per-VM control sockets.
    pub socket_prefix: String,

    /// Directory where per-VM sockets and rootfs copies live.
    pub runtime_dir: PathBuf,

    /// Number of virtual CPUs per VM.
    pub vcpu_count: u8,

    /// Memory per VM in mebibytes.
    pub mem_size_mib: u32,

    /// TCP port the in-guest agent listens on.
    pub agent_port: u16,

    /// How long to wait for a spawned hypervisor to expose its API socket.
    pub api_socket_timeout: Duration,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("_firecracker/firecracker"),
            kernel_image: PathBuf::from("_firecracker/vmlinux-5.10.225"),
            rootfs_template: PathBuf::from("python_fs_image.ext4"),
            boot_args: "ro console=ttyS0 reboot=k panic=1 pci=off nomodules \
                        random.trust_cpu=on init=/lib/systemd/systemd"
                .to_owned(),
            cni_network: "fcnet".to_owned(),
            cni_ifname: "veth0".to_owned(),
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            socket_prefix: "firecracker".to_owned(),
            runtime_dir: std::env::temp_dir(),
            vcpu_count: 1,
            mem_size_mib: 512,
            agent_port: AGENT_PORT_DEFAULT,
            api_socket_timeout: Duration::from_secs(3),
        }
    }
}

impl VmmConfig {
    /// Set the firecracker binary path.
    #[must_use]
    pub fn with_firecracker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.firecracker_bin = path.into();
        self
    }

    /// Set the kernel image path.
    #[must_use]
    pub fn with_kernel_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel_image = path.into();
        self
    }

    /// Set the rootfs template path.
    #[must_use]
    pub fn with_rootfs_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.rootfs_template = path.into();
        self
    }

    /// Set the runtime directory for sockets and rootfs copies.
    #[must_use]
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Set the CNI network name.
    #[must_use]
    pub fn with_cni_network(mut self, network: impl Into<String>) -> Self {
        self.cni_network = network.into();
        self
    }

    /// Control socket path for one VM.
    #[must_use]
    pub fn socket_path(&self, vm_id: &VmId) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-{vm_id}.sock", self.socket_prefix))
    }

    /// Writable rootfs-copy path for one VM.
    #[must_use]
    pub fn rootfs_path(&self, vm_id: &VmId) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-{vm_id}.ext4", self.rootfs_template_name()))
    }

    /// Filename component of the rootfs template, used in per-VM copy names
    /// and in the janitor's residue pattern.
    #[must_use]
    pub fn rootfs_template_name(&self) -> &str {
        template_file_name(&self.rootfs_template)
    }
}

fn template_file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("rootfs.ext4")
}

/// Sizing and timing of the warm pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of booted-but-idle VMs held warm.
    pub capacity: usize,

    /// Interval between filler ticks and health-poll retries.
    pub retry_interval: Duration,

    /// Deadline for a fresh VM to pass the boot-health gate.
    pub boot_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: POOL_CAPACITY_DEFAULT,
            retry_interval: RETRY_INTERVAL_DEFAULT,
            boot_timeout: BOOT_TIMEOUT_DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_and_rootfs_paths_embed_the_vm_id() {
        let config = VmmConfig::default().with_runtime_dir("/tmp");
        let vm_id = VmId::new();

        let socket = config.socket_path(&vm_id);
        let rootfs = config.rootfs_path(&vm_id);

        let id = vm_id.to_string();
        assert!(
            socket.to_string_lossy().contains(&id),
            "socket path must embed the VM id"
        );
        assert!(
            rootfs.to_string_lossy().contains(&id),
            "rootfs path must embed the VM id"
        );
        assert_ne!(socket, rootfs);
    }

    #[test]
    fn socket_path_uses_prefix_and_sock_suffix() {
        let config = VmmConfig::default().with_runtime_dir("/tmp");
        let path = config.socket_path(&VmId::new());
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(name.starts_with("firecracker-"), "got {name}");
        assert!(name.ends_with(".sock"), "got {name}");
    }

    #[test]
    fn rootfs_copy_name_starts_with_template_name() {
        let config = VmmConfig::default()
            .with_runtime_dir("/tmp")
            .with_rootfs_template("/images/python_fs_image.ext4");
        let path = config.rootfs_path(&VmId::new());
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(
            name.starts_with("python_fs_image.ext4-"),
            "copy name must be keyed off the template filename, got {name}"
        );
    }

    #[test]
    fn default_machine_shape_is_one_vcpu_512_mib() {
        let config = VmmConfig::default();
        assert_eq!(config.vcpu_count, 1);
        assert_eq!(config.mem_size_mib, 512);
        assert_eq!(config.agent_port, 1323);
        assert_eq!(config.api_socket_timeout, Duration::from_secs(3));
    }

    #[test]
    fn default_pool_sizing() {
        let pool = PoolConfig::default();
        assert_eq!(pool.capacity, 5);
        assert_eq!(pool.retry_interval, Duration::from_millis(100));
        assert_eq!(pool.boot_timeout, Duration::from_secs(5));
    }
}
