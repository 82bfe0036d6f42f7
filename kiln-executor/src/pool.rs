//! Warm VM pool and its filler loop.
//!
//! The pool is a bounded FIFO of health-checked handles. The single
//! producer blocks when the pool is full; that blocking send IS the
//! backpressure that stops over-provisioning. Consumers race for handles
//! with no fairness guarantee beyond the channel's.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::factory::VmFactory;
use crate::firecracker::Hypervisor;
use crate::handle::VmHandle;
use crate::health::BootGate;

/// Bounded FIFO of warm, health-checked VM handles.
#[derive(Debug)]
pub struct VmPool {
    tx: mpsc::Sender<VmHandle>,
    rx: Mutex<mpsc::Receiver<VmHandle>>,
}

impl VmPool {
    /// Create a pool bounded at `capacity` warm VMs.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Publish a handle, blocking while the pool is full.
    ///
    /// # Errors
    /// Returns the handle back if the pool has been closed.
    pub async fn publish(&self, handle: VmHandle) -> Result<(), VmHandle> {
        self.tx.send(handle).await.map_err(|e| e.0)
    }

    /// Claim one handle, blocking until one is available.
    ///
    /// Returns `None` once the pool is closed and drained.
    pub async fn claim(&self) -> Option<VmHandle> {
        self.rx.lock().await.recv().await
    }

    /// Remaining capacity; used by tests to observe occupancy bounds.
    #[must_use]
    pub fn available_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Long-running producer that keeps the pool stocked with booted,
/// health-checked VMs.
pub struct PoolFiller<H: Hypervisor> {
    factory: VmFactory<H>,
    gate: BootGate,
    pool: Arc<VmPool>,
    config: PoolConfig,
}

impl<H: Hypervisor> PoolFiller<H> {
    /// Assemble a filler over the given factory, gate and pool.
    #[must_use]
    pub fn new(
        factory: VmFactory<H>,
        gate: BootGate,
        pool: Arc<VmPool>,
        config: PoolConfig,
    ) -> Self {
        Self {
            factory,
            gate,
            pool,
            config,
        }
    }

    /// Run until `shutdown` fires. Creation and boot failures are logged
    /// and retried on the next tick, indefinitely.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let handle = match self.factory.create().await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(error = %e, "failed to create VM");
                    continue;
                }
            };

            tracing::info!(vm_id = %handle.id, ip = %handle.ip, "new VM created and started");

            if let Err(e) = self
                .gate
                .wait_for_agent(handle.id, handle.ip, self.config.boot_timeout)
                .await
            {
                tracing::warn!(vm_id = %handle.id, error = %e, "VM boot failed");
                handle.dispose().await;
                continue;
            }

            tokio::select! {
                // Exit promptly on shutdown even while blocked on a full
                // pool; the janitor sweeps whatever this drops.
                () = shutdown.cancelled() => return,
                published = self.pool.publish(handle) => {
                    if let Err(handle) = published {
                        handle.dispose().await;
                        return;
                    }
                }
            }
        }
    }
}
