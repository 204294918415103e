//! Persistence of completed transfers.
//!
//! A [`Sink`] receives the reassembled bytes and the sanitized filename and
//! reports back the name it actually stored the file under.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::sanitize::sanitize_filename;

/// A boxed future returned by [`Sink::store`].
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TransferError>> + Send + 'a>>;

/// Upper bound on `name (n).ext` candidates tried under [`CollisionPolicy::Rename`].
const MAX_RENAME_ATTEMPTS: u32 = 10_000;

/// Destination for completed transfers.
pub trait Sink: Send + Sync + 'static {
    /// Stores `bytes` under `filename` and returns the name actually used.
    fn store(&self, filename: String, bytes: Vec<u8>) -> StoreFuture<'_>;
}

/// What to do when the target filename already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Store as `name (1).ext`, `name (2).ext`, ...
    #[default]
    Rename,
    /// Replace the existing file.
    Overwrite,
    /// Fail with [`TransferError::FileExists`].
    Reject,
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Writes completed transfers into a single flat directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    policy: CollisionPolicy,
}

impl DirectorySink {
    /// Creates the sink, creating `dir` if it does not exist.
    pub fn new(dir: impl Into<PathBuf>, policy: CollisionPolicy) -> Result<Self, TransferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, policy })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    async fn write(&self, filename: &str, bytes: &[u8]) -> Result<String, TransferError> {
        let name = sanitize_filename(filename);

        match self.policy {
            CollisionPolicy::Overwrite => {
                tokio::fs::write(self.dir.join(&name), bytes).await?;
                Ok(name)
            }
            CollisionPolicy::Reject => match self.write_new(&name, bytes).await {
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(TransferError::FileExists(name))
                }
                other => other.map(|()| name).map_err(Into::into),
            },
            CollisionPolicy::Rename => {
                for attempt in 0..MAX_RENAME_ATTEMPTS {
                    let candidate = numbered_name(&name, attempt);
                    match self.write_new(&candidate, bytes).await {
                        Ok(()) => return Ok(candidate),
                        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                            debug!(filename = %candidate, "name taken, trying next");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(TransferError::FileExists(name))
            }
        }
    }

    /// Creates `name` exclusively and writes `bytes` to it.
    async fn write_new(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let path = self.dir.join(name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        remove_on_error(&path, async {
            file.write_all(bytes).await?;
            file.sync_all().await
        })
        .await
    }
}

/// Runs `write` against the freshly created file at `path`, deleting the
/// file if the write fails so no truncated upload is left behind.
async fn remove_on_error(
    path: &Path,
    write: impl Future<Output = std::io::Result<()>>,
) -> std::io::Result<()> {
    let result = write.await;
    if let Err(e) = &result {
        warn!(path = %path.display(), "write failed, removing partial file: {e}");
        if let Err(rm) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), "failed to remove partial file: {rm}");
        }
    }
    result
}

impl Sink for DirectorySink {
    fn store(&self, filename: String, bytes: Vec<u8>) -> StoreFuture<'_> {
        Box::pin(async move {
            let stored = self.write(&filename, &bytes).await?;
            let size = bytes.len();
            let digest = tokio::task::spawn_blocking(move || checksum_bytes(&bytes))
                .await
                .map_err(std::io::Error::other)?;
            info!(filename = %stored, size, sha256 = %digest, "stored upload");
            Ok(stored)
        })
    }
}

/// `report.pdf` → `report (2).pdf`; attempt 0 is the name itself.
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => format!("{} ({attempt}){}", &name[..pos], &name[pos..]),
        _ => format!("{name} ({attempt})"),
    }
}
