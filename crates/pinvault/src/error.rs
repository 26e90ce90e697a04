//! error types surfaced to pinvault callers

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// disk tree and secure element are out of sync or unreadable.
    /// a reboot (fresh process) may recover via log replay.
    #[error("hash tree desynchronized or unreadable, a reboot may recover")]
    HashTree,

    #[error("no free labels left in the tree")]
    NoFreeLabel,

    #[error("no credential at this label")]
    InvalidLabel,

    #[error("credential record present but unreadable")]
    InvalidMetadata,

    #[error("incorrect low-entropy secret")]
    InvalidMainSecret,

    #[error("incorrect reset secret")]
    InvalidResetSecret,

    /// the caller should treat the credential as locked out until a
    /// successful reset
    #[error("too many failed attempts, credential is locked out")]
    TooManyAttempts,

    #[error("pcr state does not satisfy the credential's binding criteria")]
    PcrMismatch,
}
