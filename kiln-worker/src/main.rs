//! Entry point for the `kiln-worker` HTTP server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use kiln_executor::{
    BootGate, FirecrackerVmm, Janitor, PoolConfig, PoolFiller, VmFactory, VmPool, VmmConfig,
};
use kiln_worker::{create_router, AppState, JobRunner, StateStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let vmm_config = vmm_config_from_env();
    let pool_config = pool_config_from_env();
    let state_dir = env_or("KILN_STATE_DIR", "./state_files");
    let addr = env_or("KILN_LISTEN_ADDR", "0.0.0.0:8080");

    let janitor = match Janitor::new(&vmm_config) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            tracing::error!(error = %e, "failed to build janitor");
            std::process::exit(1);
        }
    };
    // Clear residue from a previous crash before any VM is made.
    janitor.sweep();

    let store = match StateStore::open_dir(&state_dir).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(dir = %state_dir, error = %e, "failed to create state directory");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let pool = Arc::new(VmPool::new(pool_config.capacity));

    let filler = PoolFiller::new(
        VmFactory::new(FirecrackerVmm::new(vmm_config.clone()), vmm_config.clone()),
        BootGate::new(vmm_config.agent_port, pool_config.retry_interval),
        pool.clone(),
        pool_config,
    );
    tokio::spawn(filler.run(shutdown.clone()));

    if let Err(e) = janitor.clone().watch_signals(shutdown.clone()) {
        tracing::error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    let runner = Arc::new(JobRunner::new(pool, store, vmm_config.agent_port));
    let app = create_router(AppState { runner });

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "kiln worker listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn vmm_config_from_env() -> VmmConfig {
    let mut config = VmmConfig::default();
    if let Ok(bin) = std::env::var("KILN_FIRECRACKER_BIN") {
        config = config.with_firecracker_bin(bin);
    }
    if let Ok(kernel) = std::env::var("KILN_KERNEL_IMAGE") {
        config = config.with_kernel_image(kernel);
    }
    if let Ok(template) = std::env::var("KILN_ROOTFS_TEMPLATE") {
        config = config.with_rootfs_template(template);
    }
    if let Ok(network) = std::env::var("KILN_CNI_NETWORK") {
        config = config.with_cni_network(network);
    }
    config
}

fn pool_config_from_env() -> PoolConfig {
    let mut config = PoolConfig::default();
    if let Some(capacity) = std::env::var("KILN_POOL_CAPACITY")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.capacity = capacity;
    }
    config
}
