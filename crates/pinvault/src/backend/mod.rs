//! secure element boundary
//!
//! a backend is the hardware side of the protocol: it verifies secrets, is
//! the sole authority for the current root hash, and keeps a bounded log of
//! operations for crash recovery. the manager and the hash tree depend only
//! on this trait; one implementation exists per hardware family.
//!
//! implementations:
//! - software: in-process reference backend for testing, no hardware security

#[cfg(feature = "software")]
pub mod software;

use std::collections::BTreeMap;

use pintree::{Hash, TreeShape};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// failed-attempt threshold -> delay in seconds before the next attempt.
/// only the shape matters here; delays are enforced inside the backend.
pub type DelaySchedule = BTreeMap<u32, u32>;

/// delay value marking a threshold as "locked out until reset"
pub const LOCKOUT_DELAY: u32 = u32::MAX;

/// one acceptable pcr state for a pcr-bound credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrCriterion {
    pub pcr_mask: u32,
    #[serde(with = "pintree::hex_bytes")]
    pub digest: Vec<u8>,
}

/// error codes reported by the secure element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("success")]
    Success,
    #[error("low-entropy secret did not verify")]
    InvalidMainSecret,
    #[error("reset secret did not verify")]
    InvalidResetSecret,
    #[error("credential is locked out")]
    TooManyAttempts,
    #[error("backend root does not match the supplied hashes")]
    HashTreeSync,
    #[error("backend operation failed")]
    BackendOpFailed,
    #[error("pcr state mismatch")]
    PcrMismatch,
}

/// kind of a logged operation
///
/// per-credential resets are logged as `Check`: both mutate one leaf's
/// metadata and replay identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayEntryKind {
    Insert,
    Check,
    Remove,
    ResetTree,
    Invalid,
}

/// one entry from the backend's bounded operation log
#[derive(Debug, Clone)]
pub struct ReplayLogEntry {
    pub kind: ReplayEntryKind,
    pub label: u64,
    /// root hash after the logged operation completed
    pub root: Hash,
    /// record mac, populated for `Insert` entries only
    pub mac: Vec<u8>,
}

/// result of a successful insert
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub metadata: Vec<u8>,
    pub mac: Vec<u8>,
    pub root: Hash,
}

/// result of a check attempt
///
/// `new_metadata`/`new_mac` may be populated even when `error` is not
/// `Success` (attempt counters live inside the metadata) and must then be
/// persisted by the caller.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub new_metadata: Vec<u8>,
    pub new_mac: Vec<u8>,
    pub he_secret: Vec<u8>,
    pub reset_secret: Vec<u8>,
    pub error: BackendError,
    pub root: Hash,
}

/// result of a credential reset attempt
#[derive(Debug, Clone)]
pub struct ResetOutcome {
    pub new_metadata: Vec<u8>,
    pub new_mac: Vec<u8>,
    pub error: BackendError,
    pub root: Hash,
}

/// result of replaying one logged check/reset
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub new_metadata: Vec<u8>,
    pub new_mac: Vec<u8>,
}

/// secure element capability trait
///
/// `aux_hashes` arguments must be ordered leaf to root, left sibling to
/// right sibling within each level, excluding the label's own ancestor at
/// each level (see `pintree::HashTree::get_aux_hashes`). the ordering is
/// not self-describing on the wire; a deviation makes the backend's root
/// computation diverge even when every hash value is correct.
pub trait SecureBackend: Send {
    /// create a credential protected by `le_secret`, releasing `he_secret`
    /// on successful checks and unlockable with `reset_secret`
    fn insert(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        pcr_criteria: &[PcrCriterion],
    ) -> std::result::Result<InsertOutcome, BackendError>;

    /// verify `le_secret` against the credential at `label`
    fn check(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        metadata: &[u8],
        le_secret: &[u8],
    ) -> CheckOutcome;

    /// verify `reset_secret` and clear the attempt counter
    fn reset_credential(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        metadata: &[u8],
        reset_secret: &[u8],
    ) -> ResetOutcome;

    /// remove the credential at `label`
    fn remove(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        mac: &[u8],
    ) -> std::result::Result<Hash, BackendError>;

    /// fetch the authoritative root hash and the bounded operation log,
    /// newest entry first
    fn get_log(
        &mut self,
        disk_root: &Hash,
    ) -> std::result::Result<(Hash, Vec<ReplayLogEntry>), BackendError>;

    /// re-derive the post-operation metadata and mac for the logged
    /// check/reset whose post-operation root is `log_root`
    fn replay_operation(
        &mut self,
        log_root: &Hash,
        aux_hashes: &[Hash],
        old_metadata: &[u8],
    ) -> std::result::Result<ReplayOutcome, BackendError>;

    /// wipe all backend credential state and return the empty-tree root
    fn reset_tree(&mut self, shape: TreeShape) -> std::result::Result<Hash, BackendError>;

    /// opaque-metadata decoder: wrong-attempt counter, none if undecodable
    fn wrong_auth_attempts(&self, metadata: &[u8]) -> Option<u32>;

    /// opaque-metadata decoder: whether the credential still needs a pcr
    /// binding, none if undecodable
    fn needs_pcr_binding(&self, metadata: &[u8]) -> Option<bool>;
}
