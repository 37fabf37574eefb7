//! Ownership Gate
//!
//! Decides whether a caller may use an image reference. A successful check
//! yields a [`VerifiedRef`], the only form of reference the pipeline will
//! read as transform input.

use serde::{Deserialize, Serialize};

use crate::directory::{OwnedImageRecord, UserDirectory, UserId};
use crate::store::ImageRef;

/// How strictly transform inputs are tied to their owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipPolicy {
    /// Input must be one of the caller's own records.
    #[default]
    Strict,
    /// Any authenticated caller may read any reference.
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Use an existing artifact as input
    Read,
    /// Create a new artifact attributed to the caller
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Unauthenticated,
    NotOwner { owner: Option<UserId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Reference already checked against the caller.
///
/// Only [`OwnershipGate::verify`] constructs this.
#[derive(Debug, Clone)]
pub struct VerifiedRef {
    reference: ImageRef,
    caller: UserId,
    record: Option<OwnedImageRecord>,
}

impl VerifiedRef {
    pub fn reference(&self) -> &ImageRef {
        &self.reference
    }

    pub fn caller(&self) -> UserId {
        self.caller
    }

    /// Directory record for the reference, if anyone owns it
    pub fn record(&self) -> Option<&OwnedImageRecord> {
        self.record.as_ref()
    }
}

pub struct OwnershipGate {
    policy: OwnershipPolicy,
}

impl OwnershipGate {
    pub fn new(policy: OwnershipPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OwnershipPolicy {
        self.policy
    }

    /// Pure decision. Consults the directory only, never the artifact store.
    pub fn authorize(
        &self,
        caller: Option<UserId>,
        reference: &ImageRef,
        mode: AccessMode,
        directory: &dyn UserDirectory,
    ) -> Decision {
        self.check(caller, reference, mode, directory).0
    }

    /// New artifacts need an identity and nothing else.
    pub fn authorize_create(&self, caller: Option<UserId>) -> Decision {
        match caller {
            Some(_) => Decision::Allow,
            None => Decision::Deny(DenyReason::Unauthenticated),
        }
    }

    /// Authorize a read and hand back the verified reference.
    pub fn verify(
        &self,
        caller: Option<UserId>,
        reference: &ImageRef,
        directory: &dyn UserDirectory,
    ) -> Result<VerifiedRef, DenyReason> {
        let (decision, record) = self.check(caller, reference, AccessMode::Read, directory);
        match (decision, caller) {
            (Decision::Allow, Some(caller)) => Ok(VerifiedRef {
                reference: reference.clone(),
                caller,
                record,
            }),
            (Decision::Deny(reason), _) => Err(reason),
            (Decision::Allow, None) => Err(DenyReason::Unauthenticated),
        }
    }

    fn check(
        &self,
        caller: Option<UserId>,
        reference: &ImageRef,
        mode: AccessMode,
        directory: &dyn UserDirectory,
    ) -> (Decision, Option<OwnedImageRecord>) {
        let Some(caller) = caller else {
            return (Decision::Deny(DenyReason::Unauthenticated), None);
        };

        if mode == AccessMode::Write {
            return (self.authorize_create(Some(caller)), None);
        }

        let record = directory.find_image(reference);
        let owner = record.as_ref().map(|r| r.owner);
        let decision = match self.policy {
            OwnershipPolicy::Permissive => Decision::Allow,
            OwnershipPolicy::Strict if owner == Some(caller) => Decision::Allow,
            OwnershipPolicy::Strict => Decision::Deny(DenyReason::NotOwner { owner }),
        };
        (decision, record)
    }
}

impl Default for OwnershipGate {
    fn default() -> Self {
        Self::new(OwnershipPolicy::default())
    }
}
