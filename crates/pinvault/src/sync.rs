//! sync and replay engine
//!
//! every mutating or verifying operation starts here. the disk tree may be
//! behind the secure element by an unbounded number of operations (crash
//! between backend call and record write, or a whole-filesystem snapshot
//! rollback); the backend's bounded operation log lets us replay the missing
//! tail. a divergence the log cannot explain locks the manager: the spread
//! between disk and hardware state can no longer be reconciled safely.

use rand::RngCore;
use tracing::{info, warn};

use pintree::{Hash, Label};

use crate::backend::{ReplayEntryKind, ReplayLogEntry, SecureBackend};
use crate::error::{Error, Result};
use crate::manager::{CredentialManager, ManagerState};

/// replayed inserts get non-empty placeholder metadata so the label does not
/// read as absent; the record is removed again after replay completes
const PLACEHOLDER_METADATA_LEN: usize = 32;

impl<B: SecureBackend> CredentialManager<B> {
    /// reconcile the disk root with the backend's authoritative root
    ///
    /// in order of preference: the roots already match; the disk cache was
    /// merely stale and regeneration repairs it; the divergence is covered
    /// by the backend's log and replay repairs it. anything else locks the
    /// manager.
    pub(crate) fn sync(&mut self) -> Result<()> {
        if self.state == ManagerState::Locked {
            return Err(Error::HashTree);
        }

        let mut disk_root = self.tree.root_hash();
        if self.cached_root.is_none() {
            match self.backend.get_log(&disk_root) {
                Ok((root, _)) => self.cached_root = Some(root),
                Err(e) => {
                    warn!(error = %e, "cannot fetch the authoritative root");
                    self.lock();
                    return Err(Error::HashTree);
                }
            }
        }
        let Some(auth_root) = self.cached_root else {
            self.lock();
            return Err(Error::HashTree);
        };
        if disk_root == auth_root {
            return Ok(());
        }

        // assume the cache is stale before assuming the tree is wrong
        if self.tree.regenerate_cache() {
            disk_root = self.tree.root_hash();
            if disk_root == auth_root {
                info!("stale hash cache repaired by regeneration");
                return Ok(());
            }
        }

        info!("disk root diverges from the secure element, replaying the operation log");
        let (auth_root, log) = match self.backend.get_log(&disk_root) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot fetch the operation log");
                self.lock();
                return Err(Error::HashTree);
            }
        };
        let inserted = self.replay_log(disk_root, &log)?;
        self.cached_root = Some(auth_root);

        for label in inserted {
            if let Err(e) = self.remove_present_credential(label) {
                warn!(label, error = %e, "cannot drop replayed insert placeholder");
                self.lock();
                return Err(Error::HashTree);
            }
        }
        Ok(())
    }

    /// replay the log tail the disk is missing, oldest entry first
    ///
    /// `log` is newest-first as returned by the backend. if the disk root
    /// appears in it, only newer entries are replayed; otherwise the disk
    /// predates the log's retained window and the whole log is replayed as
    /// a best effort. returns the labels of replayed inserts.
    fn replay_log(&mut self, disk_root: Hash, log: &[ReplayLogEntry]) -> Result<Vec<u64>> {
        let to_replay: Vec<&ReplayLogEntry> =
            match log.iter().position(|entry| entry.root == disk_root) {
                Some(i) => log[..i].iter().rev().collect(),
                None => {
                    warn!("disk state is older than the log window, attempting a full replay");
                    log.iter().rev().collect()
                }
            };

        let mut inserted = Vec::new();
        for entry in to_replay {
            if let Err(e) = self.replay_entry(entry, &mut inserted) {
                self.lock();
                return Err(e);
            }
            if self.tree.root_hash() != entry.root {
                warn!(label = entry.label, "replayed entry did not reproduce the logged root");
                self.lock();
                return Err(Error::HashTree);
            }
        }
        Ok(inserted)
    }

    fn replay_entry(&mut self, entry: &ReplayLogEntry, inserted: &mut Vec<u64>) -> Result<()> {
        match entry.kind {
            ReplayEntryKind::Insert => {
                let label = Label::new(entry.label, self.shape).map_err(|_| Error::HashTree)?;
                let mut placeholder = vec![0u8; PLACEHOLDER_METADATA_LEN];
                rand::thread_rng().fill_bytes(&mut placeholder);
                if !self.tree.store_record(label, &entry.mac, &placeholder, true) {
                    return Err(Error::HashTree);
                }
                inserted.push(entry.label);
            }
            ReplayEntryKind::Remove => {
                let label = Label::new(entry.label, self.shape).map_err(|_| Error::HashTree)?;
                if !self.tree.remove_record(label) {
                    return Err(Error::HashTree);
                }
                // a replayed insert this remove deletes needs no cleanup pass
                inserted.retain(|&l| l != entry.label);
            }
            ReplayEntryKind::Check => {
                let label = Label::new(entry.label, self.shape).map_err(|_| Error::HashTree)?;
                let record = self.tree.get_record(label);
                if record.lost || record.metadata.is_empty() {
                    return Err(Error::HashTree);
                }
                let aux = self.tree.get_aux_hashes(label).ok_or(Error::HashTree)?;
                let out = self
                    .backend
                    .replay_operation(&entry.root, &aux, &record.metadata)
                    .map_err(|_| Error::HashTree)?;
                if !out.new_metadata.is_empty()
                    && !out.new_mac.is_empty()
                    && !self.tree.store_record(label, &out.new_mac, &out.new_metadata, true)
                {
                    return Err(Error::HashTree);
                }
            }
            ReplayEntryKind::ResetTree => {
                if !self.tree.reset() || !self.tree.regenerate_cache() {
                    return Err(Error::HashTree);
                }
                // the wipe also took any placeholders written so far
                inserted.clear();
            }
            ReplayEntryKind::Invalid => {
                warn!("invalid entry in the operation log");
                return Err(Error::HashTree);
            }
        }
        Ok(())
    }
}
