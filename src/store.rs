//! Artifact Store - Immutable Blobs Behind Logical References
//!
//! A reference is `/uploads/<name>.<ext>`. Names are 128-bit random UUIDs, so
//! concurrent `put` calls never coordinate. Stored bytes are never rewritten.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Public URL prefix every reference starts with.
pub const URL_PREFIX: &str = "/uploads/";

const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Logical, URL-shaped name of exactly one immutable artifact.
///
/// Construction validates the shape, so a held `ImageRef` can always be
/// mapped to a path inside the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef(String);

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let name = raw
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| StoreError::InvalidReference(raw.to_string()))?;

        if !is_safe_name(name) {
            return Err(StoreError::InvalidReference(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    fn from_name(name: &str) -> Self {
        Self(format!("{}{}", URL_PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name behind the prefix (`<uuid>.<ext>`)
    pub fn name(&self) -> &str {
        &self.0[URL_PREFIX.len()..]
    }

    pub fn extension(&self) -> Option<&str> {
        self.name().rsplit_once('.').map(|(_, ext)| ext)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(value: ImageRef) -> Self {
        value.0
    }
}

/// A single path segment of `[A-Za-z0-9._-]`, not hidden, never `..`.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}

fn normalize_extension(extension: &str) -> Result<String, StoreError> {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return Err(StoreError::InvalidExtension(extension.to_string()));
    }
    Ok(ext)
}

fn fresh_name(extension: &str) -> Result<String, StoreError> {
    let ext = normalize_extension(extension)?;
    Ok(format!("{}.{}", Uuid::new_v4(), ext))
}

/// Storage seam. Transformation logic only ever sees this trait.
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under a freshly generated name.
    fn put(&self, bytes: &[u8], extension: &str) -> Result<ImageRef, StoreError>;

    /// Read the artifact behind `reference`.
    fn get(&self, reference: &ImageRef) -> Result<Vec<u8>, StoreError>;
}

/// Filesystem store rooted at one directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Physical location of a reference. Always a direct child of the root.
    pub fn resolve(&self, reference: &ImageRef) -> PathBuf {
        self.root.join(reference.name())
    }
}

impl ArtifactStore for FsStore {
    fn put(&self, bytes: &[u8], extension: &str) -> Result<ImageRef, StoreError> {
        let name = fresh_name(extension)?;
        let reference = ImageRef::from_name(&name);
        let final_path = self.resolve(&reference);

        // Readers only ever see complete files: write aside, then rename.
        let staging = self.root.join(format!(".staging-{}", name));
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&staging, &final_path) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        tracing::debug!(reference = %reference, size = bytes.len(), "artifact stored");
        Ok(reference)
    }

    fn get(&self, reference: &ImageRef) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.resolve(reference)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Access counters exposed by [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub reads: usize,
    pub writes: usize,
}

/// In-memory store for tests and embedding. Counts every access.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access_counts(&self) -> AccessCounts {
        AccessCounts {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl ArtifactStore for MemoryStore {
    fn put(&self, bytes: &[u8], extension: &str) -> Result<ImageRef, StoreError> {
        let name = fresh_name(extension)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blobs.write().insert(name.clone(), Arc::from(bytes));
        Ok(ImageRef::from_name(&name))
    }

    fn get(&self, reference: &ImageRef) -> Result<Vec<u8>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .read()
            .get(reference.name())
            .map(|blob| blob.to_vec())
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }
}
