//! credential manager
//!
//! owns one on-disk hash tree and one secure element backend, and keeps the
//! two consistent: every operation starts by reconciling the disk root with
//! the backend's authoritative root (see [`sync`](crate::sync)), then drives
//! the backend operation and persists whatever it returns. once disk and
//! backend state might have separated beyond repair, the manager locks
//! itself and refuses every further operation until the process restarts —
//! availability is traded for never operating on inconsistent state.

use std::path::Path;

use tracing::warn;

use pintree::{Hash, HashTree, Label, Record, TreeShape};

use crate::backend::{BackendError, DelaySchedule, PcrCriterion, SecureBackend};
use crate::error::{Error, Result};

/// manager lifecycle: locking is one-way within a process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Operable,
    Locked,
}

pub struct CredentialManager<B: SecureBackend> {
    pub(crate) tree: HashTree,
    pub(crate) backend: B,
    pub(crate) shape: TreeShape,
    pub(crate) state: ManagerState,
    /// in-memory mirror of the backend's authoritative root, lazily populated
    pub(crate) cached_root: Option<Hash>,
}

impl<B: SecureBackend> CredentialManager<B> {
    /// open the credential store at `dir`, creating it on first use
    ///
    /// a freshly created store also resets the backend so both sides start
    /// from the same empty tree.
    pub fn new(dir: impl AsRef<Path>, backend: B, shape: TreeShape) -> Result<Self> {
        let tree = HashTree::open(dir, shape).map_err(|_| Error::HashTree)?;
        let mut manager = Self {
            tree,
            backend,
            shape,
            state: ManagerState::Operable,
            cached_root: None,
        };
        if manager.tree.freshly_created() {
            let root = manager.backend.reset_tree(shape).map_err(|_| Error::HashTree)?;
            manager.cached_root = Some(root);
        }
        Ok(manager)
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == ManagerState::Locked
    }

    /// direct access to the backend, mainly for tests and diagnostics
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// tear down the manager, handing the backend back to the caller
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// create a credential: returns the label under which it can be checked
    pub fn insert_credential(
        &mut self,
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        pcr_criteria: &[PcrCriterion],
    ) -> Result<u64> {
        self.sync()?;
        let label = self.tree.get_free_label().ok_or(Error::NoFreeLabel)?;
        let aux = self.tree.get_aux_hashes(label).ok_or(Error::HashTree)?;
        let out = self
            .backend
            .insert(
                label.value(),
                &aux,
                le_secret,
                he_secret,
                reset_secret,
                delay_schedule,
                pcr_criteria,
            )
            .map_err(map_backend_error)?;
        self.cached_root = Some(out.root);

        if !self.tree.store_record(label, &out.mac, &out.metadata, false) {
            // the backend now holds a credential the disk does not; undo it
            warn!(label = label.value(), "record write failed, rolling back backend insert");
            match self.backend.remove(label.value(), &aux, &out.mac) {
                Ok(root) => self.cached_root = Some(root),
                Err(e) => {
                    warn!(label = label.value(), error = %e, "rollback failed");
                    self.lock();
                }
            }
            return Err(Error::HashTree);
        }
        Ok(label.value())
    }

    /// verify `le_secret`; on success returns `(he_secret, reset_secret)`
    pub fn check_credential(&mut self, label: u64, le_secret: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.sync()?;
        let (label, record, aux) = self.lookup(label)?;
        let out = self.backend.check(label.value(), &aux, &record.metadata, le_secret);
        // attempt counters live inside the metadata: persist it even when
        // verification failed, or a crash would grant unlimited retries
        self.persist_backend_update(label, &out.new_mac, &out.new_metadata, out.root)?;
        match out.error {
            BackendError::Success => Ok((out.he_secret, out.reset_secret)),
            e => Err(map_backend_error(e)),
        }
    }

    /// verify `reset_secret` and clear the credential's attempt counter
    pub fn reset_credential(&mut self, label: u64, reset_secret: &[u8]) -> Result<()> {
        self.sync()?;
        let (label, record, aux) = self.lookup(label)?;
        let out = self
            .backend
            .reset_credential(label.value(), &aux, &record.metadata, reset_secret);
        self.persist_backend_update(label, &out.new_mac, &out.new_metadata, out.root)?;
        match out.error {
            BackendError::Success => Ok(()),
            e => Err(map_backend_error(e)),
        }
    }

    /// remove the credential at `label` from backend and disk
    pub fn remove_credential(&mut self, label: u64) -> Result<()> {
        self.sync()?;
        self.remove_present_credential(label)
    }

    /// wrong-attempt counter for `label`, none when unknown for any reason
    pub fn wrong_auth_attempts(&self, label: u64) -> Option<u32> {
        let record = self.readable_record(label)?;
        self.backend.wrong_auth_attempts(&record.metadata)
    }

    /// whether `label` still needs a pcr binding; false when unknown
    pub fn needs_pcr_binding(&self, label: u64) -> bool {
        self.readable_record(label)
            .and_then(|record| self.backend.needs_pcr_binding(&record.metadata))
            .unwrap_or(false)
    }

    /// remove a credential assuming `sync` already ran in this critical section
    pub(crate) fn remove_present_credential(&mut self, label: u64) -> Result<()> {
        let (label, record, aux) = self.lookup(label)?;
        let root = self
            .backend
            .remove(label.value(), &aux, &record.mac)
            .map_err(map_backend_error)?;
        self.cached_root = Some(root);
        if !self.tree.remove_record(label) {
            // the credential is gone from the backend but still on disk
            warn!(label = label.value(), "record removal failed after backend removal");
            self.lock();
            return Err(Error::HashTree);
        }
        Ok(())
    }

    pub(crate) fn lock(&mut self) {
        if self.state == ManagerState::Operable {
            warn!("credential manager entering the locked state");
            self.state = ManagerState::Locked;
        }
    }

    /// validate the label and fetch its record and aux hashes
    fn lookup(&self, label: u64) -> Result<(Label, Record, Vec<Hash>)> {
        let label = Label::new(label, self.shape).map_err(|_| Error::InvalidLabel)?;
        let record = self.tree.get_record(label);
        if record.lost {
            return Err(Error::InvalidMetadata);
        }
        if record.metadata.is_empty() {
            return Err(Error::InvalidLabel);
        }
        let aux = self.tree.get_aux_hashes(label).ok_or(Error::HashTree)?;
        Ok((label, record, aux))
    }

    /// best-effort record lookup for the read-only introspection ops
    fn readable_record(&self, label: u64) -> Option<Record> {
        if self.is_locked() {
            return None;
        }
        let label = Label::new(label, self.shape).ok()?;
        let record = self.tree.get_record(label);
        if record.lost || record.metadata.is_empty() {
            return None;
        }
        Some(record)
    }

    /// persist metadata/mac returned by the backend, if any
    fn persist_backend_update(
        &mut self,
        label: Label,
        mac: &[u8],
        metadata: &[u8],
        root: Hash,
    ) -> Result<()> {
        if metadata.is_empty() || mac.is_empty() {
            return Ok(());
        }
        // the backend already moved to `root` whether or not the write below
        // succeeds; caching it keeps the next sync honest about the divergence
        self.cached_root = Some(root);
        if !self.tree.store_record(label, mac, metadata, false) {
            // recoverable: the divergence is within the backend's log window
            warn!(label = label.value(), "failed to persist updated record");
            return Err(Error::HashTree);
        }
        Ok(())
    }
}

fn map_backend_error(error: BackendError) -> Error {
    match error {
        BackendError::Success => Error::HashTree,
        BackendError::InvalidMainSecret => Error::InvalidMainSecret,
        BackendError::InvalidResetSecret => Error::InvalidResetSecret,
        BackendError::TooManyAttempts => Error::TooManyAttempts,
        BackendError::PcrMismatch => Error::PcrMismatch,
        BackendError::HashTreeSync | BackendError::BackendOpFailed => Error::HashTree,
    }
}

#[cfg(all(test, feature = "software"))]
mod tests {
    use super::*;
    use crate::backend::software::SoftwareBackend;
    use crate::backend::LOCKOUT_DELAY;

    fn shape() -> TreeShape {
        TreeShape::new(2, 3).unwrap()
    }

    fn new_manager(dir: &Path) -> CredentialManager<SoftwareBackend> {
        CredentialManager::new(dir, SoftwareBackend::new(shape()), shape()).unwrap()
    }

    fn schedule() -> DelaySchedule {
        [(5, LOCKOUT_DELAY)].into_iter().collect()
    }

    #[test]
    fn test_insert_check_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir.path().join("vault"));
        let label = manager
            .insert_credential(b"1234", b"he secret", b"reset secret", &schedule(), &[])
            .unwrap();
        let (he, reset) = manager.check_credential(label, b"1234").unwrap();
        assert_eq!(he, b"he secret");
        assert_eq!(reset, b"reset secret");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir.path().join("vault"));
        let label = manager
            .insert_credential(b"1234", b"he", b"rs", &schedule(), &[])
            .unwrap();
        assert_eq!(
            manager.check_credential(label, b"4321"),
            Err(Error::InvalidMainSecret)
        );
        assert_eq!(manager.wrong_auth_attempts(label), Some(1));
        // the correct secret still works and clears the counter
        manager.check_credential(label, b"1234").unwrap();
        assert_eq!(manager.wrong_auth_attempts(label), Some(0));
    }

    #[test]
    fn test_removal_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir.path().join("vault"));
        let label = manager
            .insert_credential(b"1234", b"he", b"rs", &schedule(), &[])
            .unwrap();
        manager.remove_credential(label).unwrap();
        assert_eq!(manager.check_credential(label, b"1234"), Err(Error::InvalidLabel));
        assert_eq!(manager.reset_credential(label, b"rs"), Err(Error::InvalidLabel));
        assert_eq!(manager.remove_credential(label), Err(Error::InvalidLabel));
    }

    #[test]
    fn test_unknown_label_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir.path().join("vault"));
        assert_eq!(manager.check_credential(9, b"1234"), Err(Error::InvalidLabel));
        // out of the label space entirely
        assert_eq!(manager.check_credential(1 << 20, b"1234"), Err(Error::InvalidLabel));
        assert_eq!(manager.wrong_auth_attempts(9), None);
        assert!(!manager.needs_pcr_binding(9));
    }

    #[test]
    fn test_locked_manager_refuses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = new_manager(&dir.path().join("vault"));
        let label = manager
            .insert_credential(b"1234", b"he", b"rs", &schedule(), &[])
            .unwrap();
        manager.lock();
        assert!(manager.is_locked());
        assert_eq!(manager.check_credential(label, b"1234"), Err(Error::HashTree));
        assert_eq!(
            manager.insert_credential(b"1", b"2", b"3", &schedule(), &[]),
            Err(Error::HashTree)
        );
        assert_eq!(manager.wrong_auth_attempts(label), None);
    }

    #[test]
    fn test_label_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let tiny = TreeShape::new(1, 1).unwrap();
        let mut manager =
            CredentialManager::new(dir.path().join("vault"), SoftwareBackend::new(tiny), tiny)
                .unwrap();
        manager.insert_credential(b"1", b"he", b"rs", &schedule(), &[]).unwrap();
        manager.insert_credential(b"2", b"he", b"rs", &schedule(), &[]).unwrap();
        assert_eq!(
            manager.insert_credential(b"3", b"he", b"rs", &schedule(), &[]),
            Err(Error::NoFreeLabel)
        );
    }
}
