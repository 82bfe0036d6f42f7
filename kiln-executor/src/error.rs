//! Error types for the executor crate.

use std::path::PathBuf;

use kiln_core::VmId;

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Firecracker binary not found at the configured path.
    #[error("firecracker binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// KVM device is not available or not accessible.
    #[error("KVM not available: {reason}")]
    KvmUnavailable { reason: String },

    /// The rootfs template is missing or not a regular file.
    #[error("rootfs template {path} is not a regular file")]
    BadRootfsTemplate { path: PathBuf },

    /// VM failed to spawn or boot.
    #[error("VM spawn failed: {0}")]
    SpawnFailed(String),

    /// CNI network attachment failed for a VM.
    #[error("network attach failed for VM {vm_id}: {reason}")]
    NetworkAttach { vm_id: VmId, reason: String },

    /// Firecracker API request failed.
    #[error("API request failed: {0}")]
    ApiError(String),

    /// The guest agent never answered 200 before the boot deadline.
    #[error("VM {vm_id} agent not healthy within {deadline_ms}ms")]
    BootTimeout { vm_id: VmId, deadline_ms: u128 },

    /// The janitor's residue pattern failed to compile.
    #[error("residue sweep pattern invalid: {0}")]
    SweepPattern(#[from] regex::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
