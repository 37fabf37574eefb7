//! ForgeEdit Core - Owned Image Artifact Pipeline
//!
//! # The Five Rules (Non-Negotiable)
//! 1. Artifacts Are Immutable (every edit writes a new one)
//! 2. References Never Escape The Storage Root
//! 3. No Identity, No Access (checked before any storage read or write)
//! 4. Parameters Are Validated Before I/O
//! 5. Every Artifact Handed Back Is Recorded To Its Owner

pub mod accounts;
pub mod compression;
pub mod config;
pub mod directory;
pub mod filters;
pub mod hashing;
pub mod histogram;
pub mod identity;
pub mod ownership;
pub mod permits;
pub mod pipeline;
pub mod store;
pub mod transform;
pub mod validation;

pub use accounts::{AccountError, Accounts};
pub use compression::CompressionStats;
pub use config::{BootstrapAdmin, EngineConfig};
pub use directory::{
    ArtifactKind, InMemoryDirectory, OwnedImageRecord, SnapshotLock, User, UserDirectory, UserId,
};
pub use hashing::{canonical_json, compute_job_hash, sha256_hex};
pub use identity::{CookieIdentity, IdentityProvider, RequestContext};
pub use ownership::{AccessMode, Decision, OwnershipGate, OwnershipPolicy, VerifiedRef};
pub use pipeline::{ArtifactOutcome, EditPipeline, EditRequest, PipelineError};
pub use store::{ArtifactStore, FsStore, ImageRef, MemoryStore, URL_PREFIX};
pub use transform::{Operation, TransformEngine, TransformError};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
