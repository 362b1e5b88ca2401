//! # Artifact Management
//!
//! Streaming downloads into managed storage locations and the directory
//! scans that keep the artifact table honest. The two handlers coordinate
//! through the task store: a scan snapshots the destination paths of every
//! in-flight download and refuses to touch them, so a partial file is never
//! treated as an orphan or a new artifact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tokio::io::AsyncReadExt;

use crate::error::{EngineError, EngineResult};

pub mod download;
pub mod scan;
pub mod store;

pub use download::{DownloadHandler, DownloadParams};
pub use scan::ScanHandler;
pub use store::{Artifact, ArtifactStore, StorageLocation};

/// Digest algorithm for artifact verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Final path for a download inside a storage location. The scan handler
/// resolves in-flight downloads through this same function, which is what
/// makes the skip set accurate.
///
/// The name comes from `filename` or the URL's basename; names that would
/// escape the location root are rejected.
pub fn resolve_destination(
    location_path: &str,
    url: &str,
    filename: Option<&str>,
) -> EngineResult<PathBuf> {
    let name = match filename {
        Some(name) => name.to_string(),
        None => url_basename(url).ok_or_else(|| {
            EngineError::Validation(format!("cannot derive a filename from url '{url}'"))
        })?,
    };

    if name.is_empty() || name == "." || name == ".." {
        return Err(EngineError::Validation(format!(
            "invalid artifact filename '{name}'"
        )));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(EngineError::Validation(format!(
            "artifact filename '{name}' must not contain path separators"
        )));
    }

    Ok(Path::new(location_path).join(name))
}

fn url_basename(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next()?;
    let base = trimmed.trim_end_matches('/').rsplit('/').next()?;
    // Reject scheme remnants like "http:" when the url has no path
    if base.is_empty() || base.ends_with(':') {
        None
    } else {
        Some(base.to_string())
    }
}

/// Hex digest of a file, streamed in chunks so multi-GB images never sit in
/// memory.
pub async fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> EngineResult<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => hash_file_with::<Sha256>(path).await,
        ChecksumAlgorithm::Sha512 => hash_file_with::<Sha512>(path).await,
    }
}

async fn hash_file_with<D: Digest>(path: &Path) -> EngineResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
