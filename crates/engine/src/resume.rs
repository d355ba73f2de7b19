//! Sidecar manifest for resumable downloads
//!
//! One manifest per destination, stored beside it as a dot-prefixed JSON
//! file. The manifest records how far a download got together with the
//! origin validators, so a later call can decide whether the partial bytes
//! on disk are still worth keeping.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// Sentinel for "size not known yet" in [`ResumeManifest::total_bytes`].
pub const UNKNOWN_TOTAL: i64 = -1;

const MANIFEST_SUFFIX: &str = ".partial-manifest";
/// Partial files larger than this are preserved without re-hashing.
pub(crate) const HASH_CEILING: u64 = 256 * 1024 * 1024;

/// On-disk record describing a partially completed download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeManifest {
    pub url: String,
    pub file_path: String,
    pub downloaded_bytes: u64,
    /// Declared size, or [`UNKNOWN_TOTAL`]; kept at the sentinel until a
    /// later probe learns the real size
    pub total_bytes: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
    /// Content length as reported on the first probe
    pub content_length: u64,
    /// Hex SHA-256 of the partial bytes; empty skips the hash check
    #[serde(default)]
    pub checksum: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub user_agent: String,
    pub accept_ranges: bool,
    /// Chunk layout the partial bytes were written under: 1 for a
    /// single-stream partial, the plan size for chunked ones. A different
    /// layout on the next call makes the partial bytes unusable.
    #[serde(default)]
    pub chunk_count: u32,
}

impl ResumeManifest {
    /// Remaining bytes, when the total is known.
    pub fn remaining(&self) -> Option<u64> {
        u64::try_from(self.total_bytes)
            .ok()
            .map(|total| total.saturating_sub(self.downloaded_bytes))
    }
}

/// Persistence for the sidecar manifest of one destination
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dest: PathBuf,
    manifest_path: PathBuf,
}

impl ResumeStore {
    pub fn for_destination(dest: &Path) -> Self {
        Self {
            dest: dest.to_path_buf(),
            manifest_path: Self::sidecar_path(dest),
        }
    }

    /// `.<basename>.partial-manifest` in the destination's directory.
    pub fn sidecar_path(dest: &Path) -> PathBuf {
        let basename = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let sidecar = format!(".{basename}{MANIFEST_SUFFIX}");
        match dest.parent() {
            Some(parent) => parent.join(sidecar),
            None => PathBuf::from(sidecar),
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Writes the manifest atomically (temp file + rename) with
    /// owner-only permissions.
    pub async fn save(&self, manifest: &ResumeManifest) -> Result<(), DownloadError> {
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| DownloadError::config("failed to encode resume manifest").with_source(e))?;

        let tmp = self.manifest_path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| DownloadError::from_io(e, &tmp))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms)
                .await
                .map_err(|e| DownloadError::from_io(e, &tmp))?;
        }
        tokio::fs::rename(&tmp, &self.manifest_path)
            .await
            .map_err(|e| DownloadError::from_io(e, &self.manifest_path))?;
        Ok(())
    }

    /// Returns the manifest if present and parseable. A malformed sidecar
    /// is reported and ignored rather than aborting the download.
    pub async fn load(&self) -> Option<ResumeManifest> {
        let body = match tokio::fs::read(&self.manifest_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.manifest_path.display(), error = %e, "failed to read resume manifest");
                return None;
            }
        };
        match serde_json::from_slice(&body) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %self.manifest_path.display(), error = %e, "ignoring malformed resume manifest");
                None
            }
        }
    }

    /// Removes the sidecar, tolerating its absence.
    pub async fn delete(&self) -> Result<(), DownloadError> {
        match tokio::fs::remove_file(&self.manifest_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::from_io(e, &self.manifest_path)),
        }
    }

    /// Checks the manifest against the bytes actually on disk.
    ///
    /// `chunk_dir` points at the temporary chunk directory for multi-part
    /// downloads; single-stream partials live in the destination itself.
    pub async fn validate(&self, manifest: &ResumeManifest, chunk_dir: Option<&Path>) -> bool {
        let on_disk = match chunk_dir {
            Some(dir) => match chunk_bytes_on_disk(dir).await {
                Some(bytes) => bytes,
                None => return false,
            },
            None => match tokio::fs::metadata(&self.dest).await {
                Ok(meta) => meta.len(),
                Err(_) => return false,
            },
        };
        if on_disk != manifest.downloaded_bytes {
            debug!(
                expected = manifest.downloaded_bytes,
                found = on_disk,
                "partial size does not match manifest"
            );
            return false;
        }
        if !manifest.checksum.is_empty() && chunk_dir.is_none() {
            match hash_file(&self.dest).await {
                Ok(hash) if hash == manifest.checksum => {}
                Ok(_) => {
                    debug!("partial content hash does not match manifest");
                    return false;
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// True when the recorded partial state is usable: the origin supported
    /// ranges, some but not all bytes arrived, and the on-disk state checks
    /// out.
    pub async fn can_resume(&self, manifest: &ResumeManifest, chunk_dir: Option<&Path>) -> bool {
        if !manifest.accept_ranges || manifest.downloaded_bytes == 0 {
            return false;
        }
        if let Ok(total) = u64::try_from(manifest.total_bytes) {
            if manifest.downloaded_bytes >= total {
                return false;
            }
        }
        self.validate(manifest, chunk_dir).await
    }

    /// Sweeps `dir` for sidecar manifests older than `max_age`, returning
    /// how many were removed. Individual failures are logged, not fatal.
    pub async fn cleanup_older_than(dir: &Path, max_age: Duration) -> Result<usize, DownloadError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| DownloadError::from_io(e, dir))?;
        let cutoff = SystemTime::now() - max_age;
        let mut removed = 0;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "sidecar sweep stopped early");
                    break;
                }
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') || !name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let mtime = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable sidecar");
                    continue;
                }
            };
            if mtime < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove stale sidecar")
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Sums the sizes of `chunk_*` files under `dir`; `None` when the directory
/// is missing or unreadable.
pub(crate) async fn chunk_bytes_on_disk(dir: &Path) -> Option<u64> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut total = 0u64;
    while let Some(entry) = entries.next_entry().await.ok()? {
        if entry.file_name().to_string_lossy().starts_with("chunk_") {
            total += entry.metadata().await.ok()?.len();
        }
    }
    Some(total)
}

/// Hex SHA-256 over a file's current contents.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
