//! User Directory - Users and Their Owned Image Records
//!
//! Records are append-only. Insertion happens under a single write lock,
//! so there is no read-modify-write window between concurrent requests.
//!
//! A JSON snapshot shared by several processes must be loaded, mutated and
//! saved while holding its [`SnapshotLock`].

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::store::ImageRef;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot format error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Unique, case-sensitive
    pub name: String,
    /// Opaque to the directory
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw user upload
    Upload,
    /// Output of an editing operator; valid input for further edits
    Edit,
    /// Visualization (histogram); never valid as edit input
    Diagnostic,
}

impl ArtifactKind {
    pub fn is_editable(self) -> bool {
        !matches!(self, ArtifactKind::Diagnostic)
    }
}

/// What the orchestrator knows about a new artifact when attributing it.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub reference: ImageRef,
    pub original_filename: String,
    pub kind: ArtifactKind,
    pub parent: Option<ImageRef>,
    pub operation: Option<String>,
    pub content_hash: String,
    pub job_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedImageRecord {
    pub id: u64,
    pub owner: UserId,
    pub reference: ImageRef,
    pub original_filename: String,
    pub kind: ArtifactKind,
    #[serde(default)]
    pub parent: Option<ImageRef>,
    #[serde(default)]
    pub operation: Option<String>,
    pub content_hash: String,
    #[serde(default)]
    pub job_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Owner of user records and per-user image history.
pub trait UserDirectory: Send + Sync {
    fn find_by_name(&self, name: &str) -> Option<User>;

    /// Fails with `UsernameTaken` if the name exists. Check and insert are atomic.
    fn create(&self, name: &str, credential_hash: &str) -> Result<User, DirectoryError>;

    fn record_image(&self, owner: UserId, image: NewImage)
        -> Result<OwnedImageRecord, DirectoryError>;

    /// Caller's records in insertion order
    fn list_images(&self, owner: UserId) -> Vec<OwnedImageRecord>;

    /// Record for a reference, whoever owns it
    fn find_image(&self, reference: &ImageRef) -> Option<OwnedImageRecord>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryState {
    next_user_id: u64,
    next_image_id: u64,
    users: Vec<User>,
    images: Vec<OwnedImageRecord>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_reference: HashMap<ImageRef, usize>,
}

impl DirectoryState {
    fn reindex(&mut self) {
        self.by_name = self
            .users
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.clone(), i))
            .collect();
        self.by_reference = self
            .images
            .iter()
            .enumerate()
            .map(|(i, r)| (r.reference.clone(), i))
            .collect();
    }
}

/// Directory held in memory, optionally snapshotted to a JSON file.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot; a missing file yields an empty directory.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        let mut state: DirectoryState = serde_json::from_str(&content)?;
        state.reindex();
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Write through a uniquely named staging file, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<(), DirectoryError> {
        let json = serde_json::to_vec_pretty(&*self.state.read())?;
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut staging = NamedTempFile::new_in(parent)?;
        staging.write_all(&json)?;
        staging.as_file().sync_all()?;
        staging.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

}

/// Exclusive, inter-process lock on a snapshot file.
///
/// Held through a `<snapshot>.lock` sidecar so the snapshot itself can be
/// replaced by rename while the lock stays put. Released on drop.
pub struct SnapshotLock {
    file: File,
    path: PathBuf,
}

impl SnapshotLock {
    /// Block until no other holder remains.
    pub fn acquire(snapshot: &Path) -> Result<Self, DirectoryError> {
        let mut name = OsString::from(snapshot.as_os_str());
        name.push(".lock");
        let path = PathBuf::from(name);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        tracing::debug!(lock = %path.display(), "snapshot locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "snapshot unlock failed");
        }
    }
}

impl UserDirectory for InMemoryDirectory {
    fn find_by_name(&self, name: &str) -> Option<User> {
        let state = self.state.read();
        state.by_name.get(name).map(|&i| state.users[i].clone())
    }

    fn create(&self, name: &str, credential_hash: &str) -> Result<User, DirectoryError> {
        let mut state = self.state.write();
        if state.by_name.contains_key(name) {
            return Err(DirectoryError::UsernameTaken(name.to_string()));
        }

        state.next_user_id += 1;
        let user = User {
            id: UserId(state.next_user_id),
            name: name.to_string(),
            credential_hash: credential_hash.to_string(),
            created_at: Utc::now(),
        };
        let index = state.users.len();
        state.users.push(user.clone());
        state.by_name.insert(user.name.clone(), index);
        Ok(user)
    }

    fn record_image(
        &self,
        owner: UserId,
        image: NewImage,
    ) -> Result<OwnedImageRecord, DirectoryError> {
        let mut state = self.state.write();
        if !state.users.iter().any(|u| u.id == owner) {
            return Err(DirectoryError::UnknownUser(owner));
        }

        state.next_image_id += 1;
        let record = OwnedImageRecord {
            id: state.next_image_id,
            owner,
            reference: image.reference,
            original_filename: image.original_filename,
            kind: image.kind,
            parent: image.parent,
            operation: image.operation,
            content_hash: image.content_hash,
            job_hash: image.job_hash,
            created_at: Utc::now(),
        };
        let index = state.images.len();
        state.images.push(record.clone());
        state.by_reference.insert(record.reference.clone(), index);
        Ok(record)
    }

    fn list_images(&self, owner: UserId) -> Vec<OwnedImageRecord> {
        self.state
            .read()
            .images
            .iter()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect()
    }

    fn find_image(&self, reference: &ImageRef) -> Option<OwnedImageRecord> {
        let state = self.state.read();
        state
            .by_reference
            .get(reference)
            .map(|&i| state.images[i].clone())
    }
}
