//! Durable blob storage for staged snapshots.
//!
//! Every artifact lives under a key derived from the run date, so staging
//! the same run twice overwrites instead of accumulating copies.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::retry::Transient;
use crate::types::RunDate;

/// Location of a persisted snapshot. This, not the data, is what one
/// pipeline step hands to the next.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagingHandle {
    key: String,
}

impl StagingHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Handle of the manifest sidecar written next to this artifact.
    pub fn manifest(&self) -> StagingHandle {
        StagingHandle::new(manifest_key(&self.key))
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl FromStr for StagingHandle {
    type Err = StagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_key(s)?;
        Ok(StagingHandle::new(s))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StagingError {
    #[error("no staged object at {key}")]
    NotFound { key: String },
    #[error("invalid staging key '{0}'")]
    InvalidKey(String),
    #[error("i/o error at {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    fn io(key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            return StagingError::NotFound {
                key: key.to_string(),
            };
        }
        StagingError::Io {
            key: key.to_string(),
            source,
        }
    }
}

impl Transient for StagingError {
    fn is_transient(&self) -> bool {
        match self {
            StagingError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::AlreadyExists
                    | io::ErrorKind::Unsupported
            ),
            StagingError::NotFound { .. } | StagingError::InvalidKey(_) => false,
        }
    }
}

/// Durable key/value blob store.
pub trait BlobStore: Send + Sync {
    /// Writes `bytes` under `key`, replacing any previous object.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<StagingHandle, StagingError>;

    fn get(&self, handle: &StagingHandle) -> Result<Vec<u8>, StagingError>;

    fn exists(&self, handle: &StagingHandle) -> Result<bool, StagingError>;
}

/// Key of the raw extract for `run_date`.
pub fn raw_key(prefix: &str, run_date: RunDate) -> String {
    format!("{}raw/sp500_raw_{}.csv", normalized_prefix(prefix), run_date)
}

/// Key of the transformed dataset for `run_date`.
pub fn transformed_key(prefix: &str, run_date: RunDate) -> String {
    format!(
        "{}transformed/sp500_transformed_{}.csv",
        normalized_prefix(prefix),
        run_date
    )
}

pub fn manifest_key(key: &str) -> String {
    format!("{}.manifest.json", key)
}

fn normalized_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Keys are relative, slash-separated paths without `.` or `..` segments.
pub fn validate_key(key: &str) -> Result<(), StagingError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(StagingError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Blob store rooted at a local directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written object.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StagingError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<StagingHandle, StagingError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StagingError::io(key, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StagingError::InvalidKey(key.to_string()))?;
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = path.with_file_name(format!(".{}.{:08x}.tmp", file_name, suffix));

        if let Err(e) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(StagingError::io(key, e));
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StagingError::io(key, e));
        }
        tracing::debug!(key, bytes = bytes.len(), "staged object");
        Ok(StagingHandle::new(key))
    }

    fn get(&self, handle: &StagingHandle) -> Result<Vec<u8>, StagingError> {
        let path = self.path_for(handle.key())?;
        fs::read(&path).map_err(|e| StagingError::io(handle.key(), e))
    }

    fn exists(&self, handle: &StagingHandle) -> Result<bool, StagingError> {
        let path = self.path_for(handle.key())?;
        Ok(path.is_file())
    }
}

/// In-process blob store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<StagingHandle, StagingError> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(StagingHandle::new(key))
    }

    fn get(&self, handle: &StagingHandle) -> Result<Vec<u8>, StagingError> {
        self.objects
            .get(handle.key())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StagingError::NotFound {
                key: handle.key().to_string(),
            })
    }

    fn exists(&self, handle: &StagingHandle) -> Result<bool, StagingError> {
        Ok(self.objects.contains_key(handle.key()))
    }
}
