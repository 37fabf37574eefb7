//! Edit Pipeline - Single Entry Point
//!
//! Per request: Unauthenticated -> Authenticated -> Authorized -> Executed -> Recorded.
//!
//! CRITICAL: identity is resolved before anything else. A denied request
//! never reaches the artifact store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::compression::CompressionStats;
use crate::config::EngineConfig;
use crate::directory::{
    ArtifactKind, DirectoryError, NewImage, OwnedImageRecord, UserDirectory, UserId,
};
use crate::hashing::{compute_job_hash, content_hash};
use crate::identity::{IdentityProvider, RequestContext};
use crate::ownership::{Decision, DenyReason, OwnershipGate, VerifiedRef};
use crate::permits::JobPermits;
use crate::store::{ArtifactStore, ImageRef, StoreError};
use crate::transform::{Operation, Rendered, TransformEngine, TransformError};
use crate::validation::ValidationViolation;
use crate::ENGINE_VERSION;

const FALLBACK_FILENAME: &str = "upload";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Degenerate output: {0}")]
    DegenerateOutput(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl PipelineError {
    /// Stable label for structured output
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Unauthorized(_) => "unauthorized",
            PipelineError::Forbidden(_) => "forbidden",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::InvalidParameter(_) => "invalid_parameter",
            PipelineError::InvalidRegion(_) => "invalid_region",
            PipelineError::DecodeError(_) => "decode_error",
            PipelineError::DegenerateOutput(_) => "degenerate_output",
            PipelineError::StorageFailure(_) => "storage_failure",
        }
    }

    /// HTTP-equivalent status
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Unauthorized(_) => 401,
            PipelineError::Forbidden(_) => 403,
            PipelineError::NotFound(_) => 404,
            PipelineError::InvalidParameter(_) | PipelineError::InvalidRegion(_) => 400,
            PipelineError::DecodeError(_)
            | PipelineError::DegenerateOutput(_)
            | PipelineError::StorageFailure(_) => 500,
        }
    }

    /// The caller can fix the request and try again.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(r) => PipelineError::NotFound(r),
            StoreError::InvalidReference(r) => {
                PipelineError::InvalidParameter(format!("image reference {}", r))
            }
            other => PipelineError::StorageFailure(other.to_string()),
        }
    }
}

impl From<TransformError> for PipelineError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::InvalidParameter(m) => PipelineError::InvalidParameter(m),
            e @ TransformError::InvalidRegion { .. } => PipelineError::InvalidRegion(e.to_string()),
            TransformError::Decode(m) => PipelineError::DecodeError(m),
            e @ TransformError::OutputTooLarge { .. } => PipelineError::DecodeError(e.to_string()),
            e @ TransformError::DegenerateOutput => PipelineError::DegenerateOutput(e.to_string()),
            e @ TransformError::Encode(_) => PipelineError::StorageFailure(e.to_string()),
        }
    }
}

impl From<DirectoryError> for PipelineError {
    fn from(e: DirectoryError) -> Self {
        PipelineError::StorageFailure(e.to_string())
    }
}

impl From<DenyReason> for PipelineError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::Unauthenticated => {
                PipelineError::Unauthorized("no authenticated caller".to_string())
            }
            DenyReason::NotOwner { .. } => {
                PipelineError::Forbidden("image is not in the caller's gallery".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::StorageFailure(format!("serialization: {}", e))
    }
}

/// An edit against an existing artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    pub image_url: String,
    #[serde(flatten)]
    pub operation: Operation,
}

impl EditRequest {
    pub fn new(image_url: impl Into<String>, operation: Operation) -> Self {
        Self {
            image_url: image_url.into(),
            operation,
        }
    }
}

/// A new artifact, stored and attributed to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactOutcome {
    pub image_url: ImageRef,
    pub kind: ArtifactKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CompressionStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<ValidationViolation>,
    pub record: OwnedImageRecord,
}

/// The pipeline - single entry point for all artifact operations
pub struct EditPipeline {
    store: Arc<dyn ArtifactStore>,
    directory: Arc<dyn UserDirectory>,
    identity: Arc<dyn IdentityProvider>,
    gate: OwnershipGate,
    engine: TransformEngine,
    permits: JobPermits,
}

impl EditPipeline {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        directory: Arc<dyn UserDirectory>,
        identity: Arc<dyn IdentityProvider>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            directory,
            identity,
            gate: OwnershipGate::new(config.ownership_policy),
            engine: TransformEngine::from_config(config),
            permits: JobPermits::new(config.max_concurrent_jobs),
        }
    }

    /// Store a raw upload and attribute it to the caller.
    pub fn upload(
        &self,
        ctx: &RequestContext,
        original_filename: &str,
        bytes: &[u8],
    ) -> Result<ArtifactOutcome, PipelineError> {
        let caller = self.authenticate(ctx)?;
        let span = tracing::info_span!("upload", caller = %caller);
        let _enter = span.enter();
        if let Decision::Deny(reason) = self.gate.authorize_create(Some(caller)) {
            return Err(reason.into());
        }

        let sniffed = {
            let _permit = self.permits.acquire();
            self.engine.sniff(bytes)?
        };
        let filename = sanitize_filename(original_filename);

        let reference = self.store.put(bytes, sniffed.extension)?;
        tracing::info!(reference = %reference, format = ?sniffed.format, "upload stored");

        let record = self.record(
            caller,
            NewImage {
                reference: reference.clone(),
                original_filename: filename,
                kind: ArtifactKind::Upload,
                parent: None,
                operation: None,
                content_hash: content_hash(bytes),
                job_hash: None,
            },
        )?;

        Ok(ArtifactOutcome {
            image_url: reference,
            kind: ArtifactKind::Upload,
            operation: None,
            width: sniffed.width,
            height: sniffed.height,
            stats: None,
            notes: vec![],
            record,
        })
    }

    /// Apply one operator to an existing artifact, producing a new one.
    ///
    /// The input artifact is never modified.
    pub fn apply(
        &self,
        ctx: &RequestContext,
        request: &EditRequest,
    ) -> Result<ArtifactOutcome, PipelineError> {
        let op = &request.operation;
        let caller = self.authenticate(ctx)?;
        let span = tracing::info_span!("edit", op = op.name(), caller = %caller);
        let _enter = span.enter();

        let reference = ImageRef::parse(&request.image_url)?;
        let verified = self
            .gate
            .verify(Some(caller), &reference, &*self.directory)
            .map_err(|reason| {
                let policy = self.gate.policy();
                tracing::warn!(reference = %reference, ?reason, ?policy, "edit denied");
                PipelineError::from(reason)
            })?;
        if verified.record().is_some_and(|r| !r.kind.is_editable()) {
            return Err(PipelineError::InvalidParameter(format!(
                "{} is a diagnostic artifact and cannot be edited",
                reference
            )));
        }
        tracing::debug!(reference = %reference, "authorized");

        let validation = self.engine.validate(op)?;
        let job_hash = compute_job_hash(reference.as_str(), op, ENGINE_VERSION)?;

        let rendered = self.execute(&verified, op)?;
        tracing::debug!(size = rendered.bytes.len(), "executed");

        let output = self.store.put(&rendered.bytes, rendered.extension)?;
        tracing::info!(input = %reference, output = %output, "artifact created");

        let filename = verified
            .record()
            .map(|r| r.original_filename.clone())
            .unwrap_or_else(|| reference.name().to_string());
        let record = self.record(
            caller,
            NewImage {
                reference: output.clone(),
                original_filename: filename,
                kind: rendered.kind,
                parent: Some(reference),
                operation: Some(op.name().to_string()),
                content_hash: content_hash(&rendered.bytes),
                job_hash: Some(job_hash),
            },
        )?;

        Ok(ArtifactOutcome {
            image_url: output,
            kind: rendered.kind,
            operation: Some(op.name().to_string()),
            width: rendered.width,
            height: rendered.height,
            stats: rendered.stats,
            notes: validation.violations,
            record,
        })
    }

    pub fn rotate(
        &self,
        ctx: &RequestContext,
        image_url: &str,
        angle: i64,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Rotate { angle }))
    }

    pub fn crop(
        &self,
        ctx: &RequestContext,
        image_url: &str,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
    ) -> Result<ArtifactOutcome, PipelineError> {
        let op = Operation::Crop { x, y, width, height };
        self.apply(ctx, &EditRequest::new(image_url, op))
    }

    pub fn compress(
        &self,
        ctx: &RequestContext,
        image_url: &str,
        quality: i64,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Compress { quality }))
    }

    pub fn brightness(
        &self,
        ctx: &RequestContext,
        image_url: &str,
        factor: f64,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Brightness { factor }))
    }

    pub fn contrast(
        &self,
        ctx: &RequestContext,
        image_url: &str,
        factor: f64,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Contrast { factor }))
    }

    pub fn sharpen(
        &self,
        ctx: &RequestContext,
        image_url: &str,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Sharpen))
    }

    pub fn smooth(
        &self,
        ctx: &RequestContext,
        image_url: &str,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Smooth))
    }

    pub fn histogram(
        &self,
        ctx: &RequestContext,
        image_url: &str,
    ) -> Result<ArtifactOutcome, PipelineError> {
        self.apply(ctx, &EditRequest::new(image_url, Operation::Histogram))
    }

    /// Caller's records, oldest first
    pub fn gallery(&self, ctx: &RequestContext) -> Result<Vec<OwnedImageRecord>, PipelineError> {
        let caller = self.authenticate(ctx)?;
        Ok(self.directory.list_images(caller))
    }

    /// Serve artifact bytes. Public, like a static file mount.
    pub fn fetch(&self, image_url: &str) -> Result<Vec<u8>, PipelineError> {
        let reference = ImageRef::parse(image_url)?;
        Ok(self.store.get(&reference)?)
    }

    fn authenticate(&self, ctx: &RequestContext) -> Result<UserId, PipelineError> {
        match self.identity.resolve(ctx) {
            Some(caller) => {
                tracing::debug!(caller = %caller, "authenticated");
                Ok(caller)
            }
            None => {
                tracing::warn!("request without identity rejected");
                Err(DenyReason::Unauthenticated.into())
            }
        }
    }

    /// Only a verified reference can be read as transform input.
    ///
    /// The job permit covers decode and encode, never the storage read.
    fn execute(&self, input: &VerifiedRef, op: &Operation) -> Result<Rendered, PipelineError> {
        let bytes = self.store.get(input.reference())?;
        tracing::debug!(caller = %input.caller(), size = bytes.len(), "input read");

        let _permit = self.permits.acquire();
        tracing::trace!(
            in_use = self.permits.in_use(),
            capacity = self.permits.capacity(),
            "job slot held"
        );
        Ok(self.engine.apply(op, &bytes)?)
    }

    fn record(&self, caller: UserId, image: NewImage) -> Result<OwnedImageRecord, PipelineError> {
        let reference = image.reference.clone();
        self.directory.record_image(caller, image).map_err(|e| {
            tracing::warn!(
                reference = %reference,
                error = %e,
                "artifact stored but not recorded; orphaned"
            );
            PipelineError::from(e)
        })
    }
}

/// Last path segment of a client-supplied filename.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        FALLBACK_FILENAME.to_string()
    } else {
        base.to_string()
    }
}
