//! Request-scoped intermediate files.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Bytes produced mid-pipeline, owned by exactly one per-image task.
///
/// Disk artifacts are removed by [`TempArtifact::cleanup`] on the normal path
/// and by `NamedTempFile`'s drop on every other path, so a cancelled task
/// never leaves files behind.
#[derive(Debug)]
pub enum TempArtifact {
    Memory(Vec<u8>),
    Disk(NamedTempFile),
}

impl TempArtifact {
    pub fn memory(bytes: Vec<u8>) -> Self {
        Self::Memory(bytes)
    }

    pub fn disk(dir: Option<&Path>, bytes: &[u8]) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hairswap-").suffix(".jpg");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self::Disk(file))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory(_) => None,
            Self::Disk(file) => Some(file.path()),
        }
    }

    pub async fn bytes(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::Memory(bytes) => Ok(bytes.clone()),
            Self::Disk(file) => tokio::fs::read(file.path()).await,
        }
    }

    /// Best effort; failures are logged and swallowed.
    pub fn cleanup(self) {
        let Self::Disk(file) = self else {
            return;
        };
        let path = file.path().to_path_buf();
        match file.close() {
            Ok(()) => debug!(path = %path.display(), "removed temp artifact"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp artifact"),
        }
    }
}

pub fn cleanup_all(artifacts: impl IntoIterator<Item = TempArtifact>) {
    for artifact in artifacts {
        artifact.cleanup();
    }
}
