//! Crash-safe sweep of per-VM residue.
//!
//! Control sockets and rootfs copies live in one runtime directory under
//! predictable names. The janitor removes anything matching those names,
//! once at startup (residue from a previous crash) and once on a
//! terminating signal. Nothing else may touch matching paths, and the
//! sweep never reaches outside the runtime directory.

use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::VmmConfig;
use crate::ExecutorError;

/// Sweeps per-VM residue out of the runtime directory.
#[derive(Debug)]
pub struct Janitor {
    runtime_dir: PathBuf,
    pattern: Regex,
}

impl Janitor {
    /// Build a janitor whose pattern matches this configuration's socket
    /// prefix and rootfs template name.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SweepPattern`] if the pattern does not
    /// compile (possible only with a pathological template name).
    pub fn new(config: &VmmConfig) -> Result<Self, ExecutorError> {
        let pattern = Regex::new(&format!(
            "^({}-.*\\.sock|{}.*)$",
            regex::escape(&config.socket_prefix),
            regex::escape(config.rootfs_template_name()),
        ))?;
        Ok(Self {
            runtime_dir: config.runtime_dir.clone(),
            pattern,
        })
    }

    /// Returns whether a directory entry name is per-VM residue.
    #[must_use]
    pub fn is_residue(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }

    /// Remove all matching files. Idempotent; errors are logged, never
    /// propagated.
    pub fn sweep(&self) {
        let entries = match std::fs::read_dir(&self.runtime_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    dir = %self.runtime_dir.display(),
                    error = %e,
                    "failed to read runtime directory"
                );
                return;
            }
        };

        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self.is_residue(name) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => tracing::debug!(file = name, "removed residue"),
                Err(e) => tracing::warn!(file = name, error = %e, "residue removal failed"),
            }
        }
    }

    /// Install the terminating-signal watcher: SIGINT, SIGTERM and SIGQUIT
    /// each cancel `shutdown`, sweep, and exit 0.
    ///
    /// # Errors
    /// Returns the I/O error if a signal listener cannot be registered.
    pub fn watch_signals(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>, ExecutorError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("caught SIGINT, requesting clean shutdown"),
                _ = sigterm.recv() => tracing::info!("caught SIGTERM, requesting clean shutdown"),
                _ = sigquit.recv() => tracing::info!("caught SIGQUIT, forcing shutdown"),
            }
            shutdown.cancel();
            self.sweep();
            std::process::exit(0);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_janitor(dir: &std::path::Path) -> Janitor {
        let config = VmmConfig::default()
            .with_runtime_dir(dir)
            .with_rootfs_template("python_fs_image.ext4");
        match Janitor::new(&config) {
            Ok(j) => j,
            Err(e) => panic!("janitor build failed: {e}"),
        }
    }

    #[test]
    fn sweep_removes_sockets_and_rootfs_copies_only() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let keep = dir.path().join("j1_state.tgz");
        let sock = dir.path().join("firecracker-abc123.sock");
        let rootfs = dir.path().join("python_fs_image.ext4-abc123.ext4");
        for p in [&keep, &sock, &rootfs] {
            if let Err(e) = std::fs::write(p, b"x") {
                panic!("write failed: {e}");
            }
        }

        let janitor = test_janitor(dir.path());
        janitor.sweep();

        assert!(keep.exists(), "unrelated files must survive the sweep");
        assert!(!sock.exists(), "control sockets must be removed");
        assert!(!rootfs.exists(), "rootfs copies must be removed");
    }

    #[test]
    fn sweep_is_idempotent() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let janitor = test_janitor(dir.path());
        janitor.sweep();
        janitor.sweep();
    }

    #[test]
    fn residue_match_respects_prefixes() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let janitor = test_janitor(dir.path());

        assert!(janitor.is_residue("firecracker-x.sock"));
        assert!(janitor.is_residue("python_fs_image.ext4-x.ext4"));
        assert!(!janitor.is_residue("other-x.sock"), "foreign sockets are not ours");
        assert!(!janitor.is_residue("j1_state.tgz"), "state archives are not residue");
        assert!(
            !janitor.is_residue("not_python_fs_image.ext4"),
            "template name must anchor at the start"
        );
    }

    proptest::proptest! {
        #[test]
        fn proptest_our_socket_names_always_match(suffix in "[a-f0-9-]{1,40}") {
            let dir = match tempfile::tempdir() {
                Ok(d) => d,
                Err(e) => panic!("tempdir failed: {e}"),
            };
            let janitor = test_janitor(dir.path());
            let sock_name = format!("firecracker-{}.sock", suffix);
            let ext4_name = format!("python_fs_image.ext4-{}.ext4", suffix);
            proptest::prop_assert!(janitor.is_residue(&sock_name));
            proptest::prop_assert!(janitor.is_residue(&ext4_name));
        }

        #[test]
        fn proptest_foreign_names_never_match(name in "[a-z]{1,12}\\.(txt|json|tgz)") {
            let dir = match tempfile::tempdir() {
                Ok(d) => d,
                Err(e) => panic!("tempdir failed: {e}"),
            };
            let janitor = test_janitor(dir.path());
            proptest::prop_assert!(!janitor.is_residue(&name));
        }
    }
}
