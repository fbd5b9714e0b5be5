//! Duplicate detection by content hash
//!
//! A freshly downloaded file is hashed (SHA-256, fixed-size streaming reads)
//! and compared against every other file in the storage directory. Equal
//! digests mean the new file is a duplicate.
//!
//! Every completion rescans the whole directory, so the cost grows with the
//! number of stored files. An optional on-disk index remembers digests keyed
//! by name, length and mtime so unchanged files are not re-read; the rescan
//! itself (and therefore correctness) is unchanged.

use crate::error::GrabbitError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read size used while hashing
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Suffix of in-progress transfers; never considered stored content
pub const PART_SUFFIX: &str = ".part";

/// Outcome of checking a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The file was moved to its final name
    Unique { digest: String },
    /// Same content already stored under `existing`; nothing was moved
    Duplicate { existing: String, digest: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexEntry {
    len: u64,
    modified_ns: u64,
    sha256: String,
}

pub(crate) type HashIndex = HashMap<String, IndexEntry>;

#[derive(Debug)]
pub struct DuplicateDetector {
    storage_dir: PathBuf,
    index_path: Option<PathBuf>,
    /// Also serializes classification so two identical transfers finishing
    /// together cannot both be judged unique
    index: Mutex<HashIndex>,
}

impl DuplicateDetector {
    /// Create a detector, loading the persisted index if one is configured
    pub async fn open(storage_dir: PathBuf, index_path: Option<PathBuf>) -> Self {
        let index = match &index_path {
            Some(path) => load_index(path).await,
            None => HashIndex::new(),
        };

        Self {
            storage_dir,
            index_path,
            index: Mutex::new(index),
        }
    }

    /// Check `part` against stored files and, if unique, rename it to `final_name`
    ///
    /// A cancelled `cancel` token is honoured up to the rename and yields
    /// [`GrabbitError::Cancelled`] with `part` left in place.
    pub async fn classify(
        &self,
        part: &Path,
        final_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Classification, GrabbitError> {
        let mut index = self.index.lock().await;
        if cancel.is_cancelled() {
            return Err(GrabbitError::Cancelled);
        }

        let storage_dir = self.storage_dir.clone();
        let part = part.to_path_buf();
        let final_name = final_name.to_string();
        let skip = self.index_file_name();
        let current = std::mem::take(&mut *index);
        let cancel = cancel.clone();

        let (result, updated) = tokio::task::spawn_blocking(move || {
            classify_blocking(&storage_dir, &part, &final_name, skip.as_deref(), &cancel, current)
        })
        .await
        .map_err(|e| GrabbitError::Filesystem(io::Error::other(e)))?;

        *index = updated;
        if let Some(path) = &self.index_path {
            if let Err(e) = save_index(path, &index).await {
                warn!("Failed to persist hash index {}: {}", path.display(), e);
            }
        }

        result
    }

    /// Forget a stored file (deleted or renamed)
    pub async fn forget(&self, name: &str) {
        self.index.lock().await.remove(name);
    }

    /// Name of the index file when it lives inside the storage directory
    pub(crate) fn index_file_name(&self) -> Option<String> {
        let path = self.index_path.as_ref()?;
        if path.parent()? != self.storage_dir.as_path() {
            return None;
        }
        Some(path.file_name()?.to_string_lossy().into_owned())
    }

    /// Hold the classification lock, stalling every finishing worker
    #[cfg(test)]
    pub(crate) async fn hold(&self) -> tokio::sync::MutexGuard<'_, HashIndex> {
        self.index.lock().await
    }
}

fn classify_blocking(
    storage_dir: &Path,
    part: &Path,
    final_name: &str,
    skip: Option<&str>,
    cancel: &CancellationToken,
    mut index: HashIndex,
) -> (Result<Classification, GrabbitError>, HashIndex) {
    let digest = match hash_file_blocking(part) {
        Ok(digest) => digest,
        Err(e) => return (Err(e.into()), index),
    };

    let existing = match scan_for_digest(storage_dir, &digest, final_name, skip, &mut index) {
        Ok(found) => found,
        Err(e) => return (Err(e.into()), index),
    };

    if let Some(existing) = existing {
        info!("{} duplicates stored file {}", final_name, existing);
        return (Ok(Classification::Duplicate { existing, digest }), index);
    }

    if cancel.is_cancelled() {
        return (Err(GrabbitError::Cancelled), index);
    }
    let target = storage_dir.join(final_name);
    if let Err(e) = std::fs::rename(part, &target) {
        return (Err(e.into()), index);
    }
    if let Ok(meta) = std::fs::metadata(&target) {
        index.insert(
            final_name.to_string(),
            IndexEntry {
                len: meta.len(),
                modified_ns: modified_ns(&meta),
                sha256: digest.clone(),
            },
        );
    }

    (Ok(Classification::Unique { digest }), index)
}

/// Compare `digest` with every stored file, refreshing `index` on the way
fn scan_for_digest(
    storage_dir: &Path,
    digest: &str,
    exclude: &str,
    skip: Option<&str>,
    index: &mut HashIndex,
) -> io::Result<Option<String>> {
    let mut seen = HashSet::new();
    let mut found = None;

    for entry in std::fs::read_dir(storage_dir)? {
        let entry = entry?;
        // Renamed or deleted since the listing was read
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == exclude || name.ends_with(PART_SUFFIX) || Some(name.as_str()) == skip {
            continue;
        }
        seen.insert(name.clone());

        let len = meta.len();
        let modified = modified_ns(&meta);
        let cached = index
            .get(&name)
            .filter(|e| e.len == len && e.modified_ns == modified)
            .map(|e| e.sha256.clone());

        let stored_digest = match cached {
            Some(d) => d,
            None => {
                let d = match hash_file_blocking(&entry.path()) {
                    Ok(d) => d,
                    Err(e) => {
                        // Vanished or unreadable mid-scan; it cannot be a match
                        debug!("Skipping {} while scanning: {}", name, e);
                        continue;
                    }
                };
                index.insert(
                    name.clone(),
                    IndexEntry {
                        len,
                        modified_ns: modified,
                        sha256: d.clone(),
                    },
                );
                d
            }
        };

        if found.is_none() && stored_digest == digest {
            found = Some(name);
        }
    }

    index.retain(|name, _| seen.contains(name));
    Ok(found)
}

/// SHA-256 of a file, hex encoded, read in [`HASH_BLOCK_SIZE`] blocks
pub fn hash_file_blocking(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn modified_ns(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

async fn load_index(path: &Path) -> HashIndex {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring unreadable hash index {}: {}", path.display(), e);
            HashIndex::new()
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => HashIndex::new(),
        Err(e) => {
            warn!("Failed to read hash index {}: {}", path.display(), e);
            HashIndex::new()
        }
    }
}

async fn save_index(path: &Path, index: &HashIndex) -> Result<(), GrabbitError> {
    let content = serde_json::to_vec(index).map_err(|e| GrabbitError::Config(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
