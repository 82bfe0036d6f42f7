//! Firecracker hypervisor backend.
//!
//! Spawns one Firecracker process per VM inside the VM's network namespace
//! and drives it over the management API (HTTP over a Unix socket):
//! boot source, root drive, machine shape, network interface, then
//! `InstanceStart`, confirming the instance reports `Running` before the
//! machine is handed out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use kiln_core::VmId;

use crate::cni::CniNetwork;
use crate::config::VmmConfig;
use crate::machine::Machine;
use crate::unix_client::ApiClient;
use crate::ExecutorError;

/// Per-VM launch parameters computed by the factory.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    pub vm_id: VmId,
    pub socket_path: PathBuf,
    pub rootfs_path: PathBuf,
}

/// A hypervisor capable of launching microVMs.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Launch a VM and return its running machine once the hypervisor has
    /// confirmed the instance started.
    ///
    /// # Errors
    /// Implementations must not leak processes or network attachments on
    /// failure: everything acquired before the error is released again.
    async fn launch(&self, spec: &MachineSpec) -> Result<Machine, ExecutorError>;
}

/// Firecracker-backed [`Hypervisor`].
#[derive(Debug, Clone)]
pub struct FirecrackerVmm {
    config: VmmConfig,
    cni: CniNetwork,
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    state: String,
}

impl FirecrackerVmm {
    /// Create a backend from VMM configuration.
    #[must_use]
    pub fn new(config: VmmConfig) -> Self {
        let cni = CniNetwork::new(
            config.cni_network.clone(),
            config.cni_ifname.clone(),
            config.cni_bin_dir.clone(),
            config.cni_conf_dir.clone(),
        );
        Self { config, cni }
    }

    /// Wait for the hypervisor to expose its API socket, up to the
    /// configured deadline.
    async fn wait_for_socket(&self, socket_path: &Path) -> Result<(), ExecutorError> {
        let poll = Duration::from_millis(25);
        tokio::time::timeout(self.config.api_socket_timeout, async {
            while !socket_path.exists() {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .map_err(|_| {
            ExecutorError::SpawnFailed(format!(
                "no API socket at {} after {:?}",
                socket_path.display(),
                self.config.api_socket_timeout
            ))
        })
    }

    /// Configure the machine over the API and start the instance.
    async fn configure_and_boot(
        &self,
        api: &ApiClient,
        spec: &MachineSpec,
        machine: &Machine,
    ) -> Result<(), ExecutorError> {
        let boot_args = format!(
            "{} {}",
            self.config.boot_args,
            machine.network().kernel_ip_arg()
        );

        api.put(
            "/boot-source",
            serde_json::json!({
                "kernel_image_path": self.config.kernel_image,
                "boot_args": boot_args,
            }),
        )
        .await?;

        api.put(
            "/drives/rootfs",
            serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": spec.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        api.put(
            "/machine-config",
            serde_json::json!({
                "vcpu_count": self.config.vcpu_count,
                "mem_size_mib": self.config.mem_size_mib,
            }),
        )
        .await?;

        api.put(
            "/network-interfaces/eth0",
            serde_json::json!({
                "iface_id": "eth0",
                "host_dev_name": machine.network().tap_device,
            }),
        )
        .await?;

        api.put(
            "/actions",
            serde_json::json!({ "action_type": "InstanceStart" }),
        )
        .await?;

        Self::confirm_running(api).await
    }

    /// Poll instance state until the hypervisor reports `Running`.
    ///
    /// A non-2xx answer here is part of the boot race (the API server may
    /// still be settling after `InstanceStart`), so it is retried rather
    /// than treated as fatal.
    async fn confirm_running(api: &ApiClient) -> Result<(), ExecutorError> {
        let mut last_seen = "no answer".to_owned();
        for _ in 0..20u8 {
            let response = api.get("/").await?;
            if response.status.is_success() {
                let info: InstanceInfo = serde_json::from_str(&response.body)
                    .map_err(|e| ExecutorError::ApiError(format!("instance info decode: {e}")))?;
                if info.state == "Running" {
                    return Ok(());
                }
                last_seen = info.state;
            } else {
                last_seen = format!("HTTP {}", response.status);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ExecutorError::SpawnFailed(format!(
            "instance never reached Running (last seen: {last_seen})"
        )))
    }
}

#[async_trait]
impl Hypervisor for FirecrackerVmm {
    async fn launch(&self, spec: &MachineSpec) -> Result<Machine, ExecutorError> {
        if !Path::new("/dev/kvm").exists() {
            return Err(ExecutorError::KvmUnavailable {
                reason: "/dev/kvm not found".to_owned(),
            });
        }
        locate_binary(&self.config.firecracker_bin)?;

        let network = self.cni.attach(&spec.vm_id).await?;

        tracing::info!(
            vm_id = %spec.vm_id,
            ip = %network.ip,
            socket = %spec.socket_path.display(),
            "spawning firecracker VM"
        );

        // Own process group: the worker's signal disposition stays
        // authoritative and terminal signals never reach the hypervisor.
        let mut cmd = Command::new("ip");
        cmd.args(["netns", "exec", &network.netns])
            .arg(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(&spec.socket_path)
            .process_group(0)
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Err(reason) = self.cni.detach(&network).await {
                    tracing::warn!(vm_id = %spec.vm_id, %reason, "network detach failed");
                }
                return Err(ExecutorError::SpawnFailed(format!("exec firecracker: {e}")));
            }
        };

        let machine = Machine::supervise(
            spec.vm_id,
            spec.socket_path.clone(),
            network,
            Some(self.cni.clone()),
            child,
            CancellationToken::new(),
        );

        let api = ApiClient::new(&spec.socket_path);
        let booted = async {
            self.wait_for_socket(api.socket_path()).await?;
            self.configure_and_boot(&api, spec, &machine).await
        }
        .await;

        if let Err(e) = booted {
            machine.shutdown().await;
            return Err(e);
        }

        tracing::info!(vm_id = %spec.vm_id, "VM started");

        Ok(machine)
    }
}

/// Verify a binary exists either at the given path or in `PATH`.
fn locate_binary(path: &Path) -> Result<(), ExecutorError> {
    if path.components().count() > 1 {
        if path.exists() {
            return Ok(());
        }
        return Err(ExecutorError::BinaryNotFound {
            path: path.to_owned(),
        });
    }

    // Bare name: check PATH.
    let found = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(|dir| Path::new(dir).join(path))
        .any(|p| p.exists());

    if found {
        Ok(())
    } else {
        Err(ExecutorError::BinaryNotFound {
            path: path.to_owned(),
        })
    }
}
