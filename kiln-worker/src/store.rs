//! State-archive store.
//!
//! A flat directory of `<jobId>_state.tgz` archives. Each archive is
//! written at most once (job ids are unique by contract), so no locking is
//! needed; concurrent readers of one file are safe.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::WorkerError;

/// Directory of serialized interpreter-state archives.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed, mode 0755) the store directory.
    ///
    /// # Errors
    /// Returns the I/O error if the directory cannot be created.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(Self { dir })
    }

    /// Canonical archive filename for a job id.
    #[must_use]
    pub fn archive_name(job_id: &str) -> String {
        format!("{job_id}_state.tgz")
    }

    /// Whether a source job's archive exists.
    pub async fn contains(&self, job_id: &str) -> bool {
        tokio::fs::try_exists(self.dir.join(Self::archive_name(job_id)))
            .await
            .unwrap_or(false)
    }

    /// Read a source job's archive.
    ///
    /// # Errors
    /// Returns [`WorkerError::MissingSource`] if there is no archive for
    /// `job_id`.
    pub async fn read(&self, job_id: &str) -> Result<Vec<u8>, WorkerError> {
        let path = self.dir.join(Self::archive_name(job_id));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(WorkerError::MissingSource(job_id.to_owned()))
            }
            Err(e) => Err(WorkerError::Io(e)),
        }
    }

    /// Stream an agent response body into `<dir>/<name>`.
    ///
    /// The name comes off the wire from the guest and is not trusted: any
    /// value with path separators or parent components is rejected.
    ///
    /// # Errors
    /// Returns [`WorkerError::StatePersist`] on a bad name, and I/O errors
    /// from writing the file.
    pub async fn put(
        &self,
        name: &str,
        mut body: reqwest::Response,
    ) -> Result<PathBuf, WorkerError> {
        validate_archive_name(name)?;

        let path = self.dir.join(name);
        let mut file = tokio::fs::File::create(&path).await?;
        while let Some(chunk) = body.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(path)
    }

    /// The store's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn validate_archive_name(name: &str) -> Result<(), WorkerError> {
    let ok = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(WorkerError::StatePersist(format!(
            "refusing archive name {name:?}"
        )))
    }
}
