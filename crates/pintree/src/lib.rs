//! # pintree
//!
//! fixed-depth, fixed-fanout merkle tree addressed by numeric labels,
//! backing a hardware-bound credential store.
//!
//! each leaf holds one credential record `(mac, metadata)` persisted as its
//! own file; inner node hashes are kept in memory and mirrored to a leaf
//! hash cache file that is purely an optimization (it can always be rebuilt
//! from the record files). the disk is untrusted: the authoritative root
//! hash lives in a secure element, and the consumer of this crate is
//! responsible for reconciling the two.
//!
//! the hashing helpers in this module are the wire contract shared with the
//! secure element: a leaf hashes to sha256 of its record mac (all zeros when
//! empty), and an inner node hashes to sha256 over its children's hashes
//! concatenated left to right.

pub mod error;
pub mod hex_bytes;
pub mod label;
mod store;
pub mod tree;

pub use error::{Error, Result};
pub use label::{Label, TreeShape};
pub use tree::{HashTree, Record};

use sha2::{Digest, Sha256};

/// node and root hashes are 32-byte sha256 digests
pub type Hash = [u8; 32];

/// hash of an unoccupied leaf
pub const EMPTY_LEAF_HASH: Hash = [0u8; 32];

/// hash of an occupied leaf: sha256 of the record mac
///
/// derived from the mac alone so it can be recomputed on paths where the
/// record metadata is unavailable (removal, replay of a logged insert).
pub fn leaf_hash(mac: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(mac);
    hasher.finalize().into()
}

/// hash of an inner node: sha256 over all child hashes, left to right
pub fn node_hash(children: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    for child in children {
        hasher.update(child);
    }
    hasher.finalize().into()
}

/// recompute the root hash from one leaf plus its aux hashes
///
/// `aux` must contain, for every level from the leaf up to (but excluding)
/// the root, the hashes of all siblings not on the path to `label`, ordered
/// left to right within each level and leaf to root across levels. returns
/// none if `aux` has the wrong length for the tree shape.
pub fn root_from_leaf(label: Label, leaf: Hash, aux: &[Hash]) -> Option<Hash> {
    let shape = label.shape();
    let fanout = shape.fanout();
    let per_level = fanout - 1;
    if aux.len() != per_level * shape.height() as usize {
        return None;
    }

    let mut current = leaf;
    let mut index = label.value();
    for level in 0..shape.height() as usize {
        let pos = (index % fanout as u64) as usize;
        let siblings = &aux[level * per_level..(level + 1) * per_level];
        let mut children = Vec::with_capacity(fanout);
        children.extend_from_slice(&siblings[..pos]);
        children.push(current);
        children.extend_from_slice(&siblings[pos..]);
        current = node_hash(&children);
        index /= fanout as u64;
    }
    Some(current)
}

/// root hash of a tree of the given shape with every leaf empty
pub fn empty_root(shape: TreeShape) -> Hash {
    let mut current = EMPTY_LEAF_HASH;
    for _ in 0..shape.height() {
        current = node_hash(&vec![current; shape.fanout()]);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_hash_differs_from_empty() {
        assert_ne!(leaf_hash(b"some mac"), EMPTY_LEAF_HASH);
    }

    #[test]
    fn test_empty_root_matches_manual_fold() {
        let shape = TreeShape::new(2, 2).unwrap();
        let level1 = node_hash(&[EMPTY_LEAF_HASH; 4]);
        let root = node_hash(&[level1; 4]);
        assert_eq!(empty_root(shape), root);
    }

    #[test]
    fn test_root_from_leaf_rejects_wrong_aux_length() {
        let shape = TreeShape::new(2, 3).unwrap();
        let label = Label::new(0, shape).unwrap();
        assert!(root_from_leaf(label, EMPTY_LEAF_HASH, &[]).is_none());
    }
}
