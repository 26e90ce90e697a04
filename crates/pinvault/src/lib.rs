//! # pinvault
//!
//! brute-force protection for low-entropy secrets (pins), bound to a secure
//! element. the secure element is the sole authority for what the credential
//! store contains; the disk only carries the records, laid out as a merkle
//! tree (see `pintree`) whose root the element tracks. an attacker who can
//! read or roll back the disk gains nothing: every verification attempt must
//! go through the element, attempt counters survive snapshot rollbacks via
//! log replay, and a divergence the replay log cannot explain fails closed.
//!
//! ```text
//!  caller ──► CredentialManager ──► sync (disk root vs element root)
//!                    │                      │ stale cache? regenerate
//!                    │                      │ diverged?    replay log
//!                    ▼                      ▼
//!              SecureBackend ◄──── aux hashes ──── pintree::HashTree
//!              (secret ops,                        (records on disk,
//!               root authority,                     root recompute)
//!               bounded op log)
//! ```
//!
//! ## usage
//!
//! ```rust,ignore
//! use pinvault::{CredentialManager, SoftwareBackend, DelaySchedule, LOCKOUT_DELAY};
//! use pintree::TreeShape;
//!
//! let shape = TreeShape::default();
//! let backend = SoftwareBackend::new(shape);
//! let mut manager = CredentialManager::new("/var/lib/vault", backend, shape)?;
//!
//! let schedule: DelaySchedule = [(5, LOCKOUT_DELAY)].into_iter().collect();
//! let label = manager.insert_credential(b"1234", b"he_secret", b"reset", &schedule, &[])?;
//! let (he_secret, _) = manager.check_credential(label, b"1234")?;
//! ```

pub mod backend;
pub mod error;
pub mod manager;
mod sync;

pub use backend::{
    BackendError, CheckOutcome, DelaySchedule, InsertOutcome, PcrCriterion, ReplayEntryKind,
    ReplayLogEntry, ReplayOutcome, ResetOutcome, SecureBackend, LOCKOUT_DELAY,
};
pub use error::{Error, Result};
pub use manager::{CredentialManager, ManagerState};

#[cfg(feature = "software")]
pub use backend::software::SoftwareBackend;

pub use pintree::{Hash, HashTree, Label, TreeShape};
