//! VM factory — manufactures fresh, booted VM handles.

use std::path::Path;

use kiln_core::VmId;

use crate::config::VmmConfig;
use crate::firecracker::{Hypervisor, MachineSpec};
use crate::handle::VmHandle;
use crate::ExecutorError;

/// Creates VM handles: allocates an id, copies the rootfs template, launches
/// the hypervisor, and wraps the result.
///
/// `create` never leaks partial state: if the launch fails after the rootfs
/// copy was made, the copy is removed again before the error surfaces.
pub struct VmFactory<H: Hypervisor> {
    vmm: H,
    config: VmmConfig,
}

impl<H: Hypervisor> VmFactory<H> {
    /// Create a factory over the given hypervisor and configuration.
    #[must_use]
    pub fn new(vmm: H, config: VmmConfig) -> Self {
        Self { vmm, config }
    }

    /// Manufacture one VM.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BadRootfsTemplate`] if the template is
    /// missing or not a regular file, and propagates hypervisor launch
    /// failures.
    pub async fn create(&self) -> Result<VmHandle, ExecutorError> {
        let vm_id = VmId::new();
        let rootfs_path = self.config.rootfs_path(&vm_id);

        copy_template(&self.config.rootfs_template, &rootfs_path).await?;

        let spec = MachineSpec {
            vm_id,
            socket_path: self.config.socket_path(&vm_id),
            rootfs_path: rootfs_path.clone(),
        };

        match self.vmm.launch(&spec).await {
            Ok(machine) => Ok(VmHandle::new(
                vm_id,
                rootfs_path,
                spec.socket_path,
                machine,
            )),
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&rootfs_path).await {
                    tracing::warn!(vm_id = %vm_id, error = %rm, "rootfs copy removal failed");
                }
                Err(e)
            }
        }
    }
}

/// Full-file copy of the read-only template to a per-VM writable path.
async fn copy_template(template: &Path, dst: &Path) -> Result<(), ExecutorError> {
    let meta = tokio::fs::metadata(template)
        .await
        .map_err(|_| ExecutorError::BadRootfsTemplate {
            path: template.to_owned(),
        })?;
    if !meta.is_file() {
        return Err(ExecutorError::BadRootfsTemplate {
            path: template.to_owned(),
        });
    }

    tokio::fs::copy(template, dst).await?;
    Ok(())
}
