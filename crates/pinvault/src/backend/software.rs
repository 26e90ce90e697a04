//! software backend - in-process reference implementation for testing
//!
//! no hardware security: secrets live in process memory and the "hardware"
//! root hash is an ordinary field. NOT for production, use a secure element
//! backend instead. it does enforce the full protocol, including aux-hash
//! verification against its own root, so tests exercise the same wire
//! contract a real secure element would.

use std::collections::VecDeque;

use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use pintree::{empty_root, leaf_hash, root_from_leaf, Hash, Label, TreeShape, EMPTY_LEAF_HASH};

use super::{
    BackendError, CheckOutcome, DelaySchedule, InsertOutcome, PcrCriterion, ReplayEntryKind,
    ReplayLogEntry, ReplayOutcome, ResetOutcome, SecureBackend, LOCKOUT_DELAY,
};

type HmacSha256 = Hmac<Sha256>;

/// secure elements retain a very small log; two entries is typical
const DEFAULT_LOG_CAPACITY: usize = 2;

/// the opaque metadata blob, interpreted only on this side of the boundary
#[derive(Serialize, Deserialize, Clone)]
struct CredState {
    #[serde(with = "pintree::hex_bytes")]
    le_digest: Vec<u8>,
    #[serde(with = "pintree::hex_bytes")]
    he_secret: Vec<u8>,
    #[serde(with = "pintree::hex_bytes")]
    reset_secret: Vec<u8>,
    attempts: u32,
    delay_schedule: DelaySchedule,
    pcr_criteria: Vec<PcrCriterion>,
}

/// log entry plus the private state needed to serve `replay_operation`
struct LogSlot {
    entry: ReplayLogEntry,
    prev_root: Hash,
    result_metadata: Vec<u8>,
    result_mac: Vec<u8>,
}

pub struct SoftwareBackend {
    mac_key: [u8; 32],
    shape: TreeShape,
    root: Hash,
    log: VecDeque<LogSlot>,
    log_capacity: usize,
    /// simulated current pcr state, settable by tests
    pcr_digest: Vec<u8>,
}

impl SoftwareBackend {
    pub fn new(shape: TreeShape) -> Self {
        let mut mac_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut mac_key);
        Self {
            mac_key,
            shape,
            root: empty_root(shape),
            log: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            pcr_digest: Vec::new(),
        }
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    /// change the simulated pcr state
    pub fn set_pcr_digest(&mut self, digest: Vec<u8>) {
        self.pcr_digest = digest;
    }

    fn record_mac(&self, label: u64, metadata: &[u8]) -> Vec<u8> {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.mac_key)
            .expect("hmac accepts keys of any length");
        mac.update(&label.to_le_bytes());
        mac.update(metadata);
        mac.finalize().into_bytes().to_vec()
    }

    /// check that `leaf` plus `aux` reproduces our authoritative root
    fn verify_root(&self, label: Label, leaf: Hash, aux: &[Hash]) -> bool {
        root_from_leaf(label, leaf, aux) == Some(self.root)
    }

    fn push_log(
        &mut self,
        kind: ReplayEntryKind,
        label: u64,
        prev_root: Hash,
        root: Hash,
        mac: Vec<u8>,
        result_metadata: Vec<u8>,
        result_mac: Vec<u8>,
    ) {
        if self.log.len() == self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(LogSlot {
            entry: ReplayLogEntry { kind, label, root, mac },
            prev_root,
            result_metadata,
            result_mac,
        });
    }

    /// verify aux ordering and current leaf, then apply a leaf transition
    fn transition(
        &mut self,
        label: Label,
        old_leaf: Hash,
        new_leaf: Hash,
        aux: &[Hash],
    ) -> std::result::Result<Hash, BackendError> {
        if !self.verify_root(label, old_leaf, aux) {
            return Err(BackendError::HashTreeSync);
        }
        root_from_leaf(label, new_leaf, aux).ok_or(BackendError::HashTreeSync)
    }
}

fn locked_out(attempts: u32, schedule: &DelaySchedule) -> bool {
    schedule
        .range(..=attempts)
        .next_back()
        .is_some_and(|(_, &delay)| delay == LOCKOUT_DELAY)
}

fn pcr_satisfied(criteria: &[PcrCriterion], current: &[u8]) -> bool {
    criteria.is_empty() || criteria.iter().any(|c| c.digest == current)
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

impl SecureBackend for SoftwareBackend {
    fn insert(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        pcr_criteria: &[PcrCriterion],
    ) -> std::result::Result<InsertOutcome, BackendError> {
        let label = Label::new(label, self.shape).map_err(|_| BackendError::BackendOpFailed)?;
        let state = CredState {
            le_digest: sha256(le_secret),
            he_secret: he_secret.to_vec(),
            reset_secret: reset_secret.to_vec(),
            attempts: 0,
            delay_schedule: delay_schedule.clone(),
            pcr_criteria: pcr_criteria.to_vec(),
        };
        let metadata = serde_json::to_vec(&state).map_err(|_| BackendError::BackendOpFailed)?;
        let mac = self.record_mac(label.value(), &metadata);
        let new_root = self.transition(label, EMPTY_LEAF_HASH, leaf_hash(&mac), aux_hashes)?;

        let prev_root = self.root;
        self.push_log(
            ReplayEntryKind::Insert,
            label.value(),
            prev_root,
            new_root,
            mac.clone(),
            Vec::new(),
            Vec::new(),
        );
        self.root = new_root;
        Ok(InsertOutcome { metadata, mac, root: new_root })
    }

    fn check(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        metadata: &[u8],
        le_secret: &[u8],
    ) -> CheckOutcome {
        let root = self.root;
        let fail = |error| CheckOutcome {
            new_metadata: Vec::new(),
            new_mac: Vec::new(),
            he_secret: Vec::new(),
            reset_secret: Vec::new(),
            error,
            root,
        };

        let Ok(label) = Label::new(label, self.shape) else {
            return fail(BackendError::BackendOpFailed);
        };
        let Ok(state) = serde_json::from_slice::<CredState>(metadata) else {
            return fail(BackendError::BackendOpFailed);
        };
        let old_mac = self.record_mac(label.value(), metadata);
        if !self.verify_root(label, leaf_hash(&old_mac), aux_hashes) {
            return fail(BackendError::HashTreeSync);
        }
        if locked_out(state.attempts, &state.delay_schedule) {
            return fail(BackendError::TooManyAttempts);
        }
        if !pcr_satisfied(&state.pcr_criteria, &self.pcr_digest) {
            return fail(BackendError::PcrMismatch);
        }

        let correct = state.le_digest == sha256(le_secret);
        let mut new_state = state.clone();
        new_state.attempts = if correct { 0 } else { state.attempts + 1 };
        let Ok(new_metadata) = serde_json::to_vec(&new_state) else {
            return fail(BackendError::BackendOpFailed);
        };
        let new_mac = self.record_mac(label.value(), &new_metadata);
        let Some(new_root) = root_from_leaf(label, leaf_hash(&new_mac), aux_hashes) else {
            return fail(BackendError::HashTreeSync);
        };

        let prev_root = self.root;
        self.push_log(
            ReplayEntryKind::Check,
            label.value(),
            prev_root,
            new_root,
            Vec::new(),
            new_metadata.clone(),
            new_mac.clone(),
        );
        self.root = new_root;
        debug!(label = label.value(), correct, "check attempt");

        CheckOutcome {
            new_metadata,
            new_mac,
            he_secret: if correct { state.he_secret } else { Vec::new() },
            reset_secret: if correct { state.reset_secret } else { Vec::new() },
            error: if correct { BackendError::Success } else { BackendError::InvalidMainSecret },
            root: new_root,
        }
    }

    fn reset_credential(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        metadata: &[u8],
        reset_secret: &[u8],
    ) -> ResetOutcome {
        let root = self.root;
        let fail = |error| ResetOutcome {
            new_metadata: Vec::new(),
            new_mac: Vec::new(),
            error,
            root,
        };

        let Ok(label) = Label::new(label, self.shape) else {
            return fail(BackendError::BackendOpFailed);
        };
        let Ok(state) = serde_json::from_slice::<CredState>(metadata) else {
            return fail(BackendError::BackendOpFailed);
        };
        let old_mac = self.record_mac(label.value(), metadata);
        if !self.verify_root(label, leaf_hash(&old_mac), aux_hashes) {
            return fail(BackendError::HashTreeSync);
        }
        if state.reset_secret != reset_secret {
            return fail(BackendError::InvalidResetSecret);
        }

        let mut new_state = state;
        new_state.attempts = 0;
        let Ok(new_metadata) = serde_json::to_vec(&new_state) else {
            return fail(BackendError::BackendOpFailed);
        };
        let new_mac = self.record_mac(label.value(), &new_metadata);
        let Some(new_root) = root_from_leaf(label, leaf_hash(&new_mac), aux_hashes) else {
            return fail(BackendError::HashTreeSync);
        };

        let prev_root = self.root;
        self.push_log(
            ReplayEntryKind::Check,
            label.value(),
            prev_root,
            new_root,
            Vec::new(),
            new_metadata.clone(),
            new_mac.clone(),
        );
        self.root = new_root;

        ResetOutcome { new_metadata, new_mac, error: BackendError::Success, root: new_root }
    }

    fn remove(
        &mut self,
        label: u64,
        aux_hashes: &[Hash],
        mac: &[u8],
    ) -> std::result::Result<Hash, BackendError> {
        let label = Label::new(label, self.shape).map_err(|_| BackendError::BackendOpFailed)?;
        let new_root = self.transition(label, leaf_hash(mac), EMPTY_LEAF_HASH, aux_hashes)?;
        let prev_root = self.root;
        self.push_log(
            ReplayEntryKind::Remove,
            label.value(),
            prev_root,
            new_root,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        self.root = new_root;
        Ok(new_root)
    }

    fn get_log(
        &mut self,
        _disk_root: &Hash,
    ) -> std::result::Result<(Hash, Vec<ReplayLogEntry>), BackendError> {
        let entries = self.log.iter().rev().map(|slot| slot.entry.clone()).collect();
        Ok((self.root, entries))
    }

    fn replay_operation(
        &mut self,
        log_root: &Hash,
        aux_hashes: &[Hash],
        old_metadata: &[u8],
    ) -> std::result::Result<ReplayOutcome, BackendError> {
        let slot = self
            .log
            .iter()
            .find(|slot| slot.entry.root == *log_root && slot.entry.kind == ReplayEntryKind::Check)
            .ok_or(BackendError::BackendOpFailed)?;
        let label =
            Label::new(slot.entry.label, self.shape).map_err(|_| BackendError::BackendOpFailed)?;
        // the caller's disk must be exactly at the pre-operation state
        let old_mac = self.record_mac(label.value(), old_metadata);
        if root_from_leaf(label, leaf_hash(&old_mac), aux_hashes) != Some(slot.prev_root) {
            return Err(BackendError::HashTreeSync);
        }
        Ok(ReplayOutcome {
            new_metadata: slot.result_metadata.clone(),
            new_mac: slot.result_mac.clone(),
        })
    }

    fn reset_tree(&mut self, shape: TreeShape) -> std::result::Result<Hash, BackendError> {
        self.shape = shape;
        self.root = empty_root(shape);
        self.log.clear();
        let root = self.root;
        self.push_log(
            ReplayEntryKind::ResetTree,
            0,
            root,
            root,
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        Ok(root)
    }

    fn wrong_auth_attempts(&self, metadata: &[u8]) -> Option<u32> {
        let state: CredState = serde_json::from_slice(metadata).ok()?;
        Some(state.attempts)
    }

    fn needs_pcr_binding(&self, metadata: &[u8]) -> Option<bool> {
        let state: CredState = serde_json::from_slice(metadata).ok()?;
        Some(state.pcr_criteria.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> TreeShape {
        TreeShape::new(2, 3).unwrap()
    }

    /// aux hashes for a leaf in an otherwise empty tree
    fn empty_aux(s: TreeShape) -> Vec<Hash> {
        let mut aux = Vec::new();
        let mut level_hash = EMPTY_LEAF_HASH;
        for _ in 0..s.height() {
            for _ in 0..s.fanout() - 1 {
                aux.push(level_hash);
            }
            level_hash = pintree::node_hash(&vec![level_hash; s.fanout()]);
        }
        aux
    }

    #[test]
    fn test_insert_then_check() {
        let mut backend = SoftwareBackend::new(shape());
        let aux = empty_aux(shape());
        let out = backend
            .insert(3, &aux, b"1234", b"high entropy", b"reset", &DelaySchedule::new(), &[])
            .unwrap();
        let check = backend.check(3, &aux, &out.metadata, b"1234");
        assert_eq!(check.error, BackendError::Success);
        assert_eq!(check.he_secret, b"high entropy");
        assert_eq!(check.reset_secret, b"reset");
    }

    #[test]
    fn test_wrong_secret_bumps_attempts() {
        let mut backend = SoftwareBackend::new(shape());
        let aux = empty_aux(shape());
        let out = backend
            .insert(0, &aux, b"1234", b"he", b"rs", &DelaySchedule::new(), &[])
            .unwrap();
        let check = backend.check(0, &aux, &out.metadata, b"9999");
        assert_eq!(check.error, BackendError::InvalidMainSecret);
        assert!(check.he_secret.is_empty());
        assert_eq!(backend.wrong_auth_attempts(&check.new_metadata), Some(1));
    }

    #[test]
    fn test_wrong_aux_is_sync_failure() {
        let mut backend = SoftwareBackend::new(shape());
        let aux = empty_aux(shape());
        let out = backend
            .insert(1, &aux, b"1234", b"he", b"rs", &DelaySchedule::new(), &[])
            .unwrap();
        let mut bad_aux = aux.clone();
        bad_aux[0] = [7u8; 32];
        let check = backend.check(1, &bad_aux, &out.metadata, b"1234");
        assert_eq!(check.error, BackendError::HashTreeSync);
    }

    #[test]
    fn test_lockout_threshold() {
        let schedule: DelaySchedule = [(2, LOCKOUT_DELAY)].into_iter().collect();
        assert!(!locked_out(0, &schedule));
        assert!(!locked_out(1, &schedule));
        assert!(locked_out(2, &schedule));
        assert!(locked_out(5, &schedule));
    }

    #[test]
    fn test_log_is_bounded() {
        let mut backend = SoftwareBackend::new(shape()).with_log_capacity(2);
        backend.reset_tree(shape()).unwrap();
        let aux = empty_aux(shape());
        let out = backend
            .insert(0, &aux, b"1", b"he", b"rs", &DelaySchedule::new(), &[])
            .unwrap();
        // label 0 is still the only occupied leaf, so its aux is unchanged
        backend.check(0, &aux, &out.metadata, b"1");
        let (_, log) = backend.get_log(&[0u8; 32]).unwrap();
        assert_eq!(log.len(), 2);
        // newest first
        assert_eq!(log[0].kind, ReplayEntryKind::Check);
        assert_eq!(log[1].kind, ReplayEntryKind::Insert);
    }
}
