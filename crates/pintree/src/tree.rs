//! the on-disk hash tree
//!
//! all node hashes are held in memory as one `Vec<Hash>` per level, leaves
//! first, mirrored to the cache file after every mutation. record files are
//! the ground truth; the cache only exists so reopening the tree does not
//! require re-reading every record.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::label::{Label, TreeShape};
use crate::{leaf_hash, node_hash, store, Hash, EMPTY_LEAF_HASH};

/// one credential record as read from disk
///
/// an empty `metadata` means no record exists at the label. `lost` means a
/// record file is present but unreadable, which the caller must treat as
/// unrecoverable for that label.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub mac: Vec<u8>,
    pub metadata: Vec<u8>,
    pub lost: bool,
}

pub struct HashTree {
    dir: PathBuf,
    shape: TreeShape,
    /// layers[0] = leaves, layers[height] = [root]
    layers: Vec<Vec<Hash>>,
    occupied: BTreeSet<u64>,
    valid: bool,
    freshly_created: bool,
}

impl HashTree {
    /// open the tree at `dir`, creating an empty one if the directory is absent
    ///
    /// a corrupt or stale cache file is repaired here by regeneration from
    /// the record files; only filesystem-level failures are fatal.
    pub fn open(dir: impl AsRef<Path>, shape: TreeShape) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let freshly_created = !dir.exists();
        if freshly_created {
            std::fs::create_dir_all(&dir)?;
        }

        let mut tree = Self {
            dir,
            shape,
            layers: Vec::new(),
            occupied: BTreeSet::new(),
            valid: true,
            freshly_created,
        };

        if freshly_created {
            tree.layers = build_layers(shape, vec![EMPTY_LEAF_HASH; shape.num_labels() as usize]);
            store::write_cache(&tree.dir, shape, &tree.layers[0])?;
            return Ok(tree);
        }

        tree.occupied = store::scan_labels(&tree.dir)?.into_iter().collect();
        match store::read_cache(&tree.dir, shape) {
            Ok(leaves) => {
                tree.layers = build_layers(shape, leaves);
            }
            Err(_) => {
                warn!("hash cache unreadable, regenerating from record files");
                tree.layers =
                    build_layers(shape, vec![EMPTY_LEAF_HASH; shape.num_labels() as usize]);
                if !tree.regenerate_cache() {
                    tree.valid = false;
                }
            }
        }
        Ok(tree)
    }

    /// true iff the on-disk structure was parseable and self-consistent
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// true iff `open` created the tree rather than loading an existing one
    pub fn freshly_created(&self) -> bool {
        self.freshly_created
    }

    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    /// lowest unoccupied label, or none if the address space is exhausted
    pub fn get_free_label(&self) -> Option<Label> {
        (0..self.shape.num_labels())
            .find(|v| !self.occupied.contains(v))
            .and_then(|v| Label::new(v, self.shape).ok())
    }

    /// read the record at `label`; never fails, see [`Record`] for sentinels
    pub fn get_record(&self, label: Label) -> Record {
        if !self.occupied.contains(&label.value()) {
            return Record::default();
        }
        match store::read_record(&self.dir, label.value()) {
            Ok(Some((mac, metadata))) => Record { mac, metadata, lost: false },
            Ok(None) => Record::default(),
            Err(_) => {
                warn!(label = label.value(), "record file unreadable");
                Record { mac: Vec::new(), metadata: Vec::new(), lost: true }
            }
        }
    }

    /// sibling hashes needed to recompute the root from `label`'s leaf
    ///
    /// ordered leaf level first, left to right within each level, excluding
    /// the label's own ancestor at each level. this exact ordering is the
    /// wire contract with the secure element.
    pub fn get_aux_hashes(&self, label: Label) -> Option<Vec<Hash>> {
        if label.shape() != self.shape {
            return None;
        }
        let fanout = self.shape.fanout() as u64;
        let mut aux = Vec::with_capacity((fanout as usize - 1) * self.shape.height() as usize);
        let mut index = label.value();
        for level in 0..self.shape.height() as usize {
            let parent = index / fanout;
            for child in parent * fanout..(parent + 1) * fanout {
                if child != index {
                    aux.push(self.layers[level][child as usize]);
                }
            }
            index = parent;
        }
        Some(aux)
    }

    /// write a leaf record, creating it if absent
    ///
    /// `is_replay` marks writes performed by log replay, where overwriting
    /// an existing label is expected.
    pub fn store_record(&mut self, label: Label, mac: &[u8], metadata: &[u8], is_replay: bool) -> bool {
        if self.occupied.contains(&label.value()) && !is_replay {
            debug!(label = label.value(), "overwriting existing record");
        }
        if let Err(e) = store::write_record(&self.dir, label.value(), mac, metadata) {
            warn!(label = label.value(), error = %e, "record write failed");
            return false;
        }
        self.occupied.insert(label.value());
        self.update_path(label.value(), leaf_hash(mac));
        self.persist_cache();
        true
    }

    /// delete a leaf record and update the ancestor hashes
    pub fn remove_record(&mut self, label: Label) -> bool {
        if !self.occupied.contains(&label.value()) {
            warn!(label = label.value(), "removing a label with no record");
            return false;
        }
        if let Err(e) = store::remove_record(&self.dir, label.value()) {
            warn!(label = label.value(), error = %e, "record removal failed");
            return false;
        }
        self.occupied.remove(&label.value());
        self.update_path(label.value(), EMPTY_LEAF_HASH);
        self.persist_cache();
        true
    }

    /// current disk-derived root hash
    pub fn root_hash(&self) -> Hash {
        self.layers[self.shape.height() as usize][0]
    }

    /// rebuild every leaf hash from the record files and rewrite the cache
    ///
    /// an unreadable record file keeps its previous in-memory hash as a best
    /// effort; the caller will observe the divergence at the root if that
    /// guess is wrong.
    pub fn regenerate_cache(&mut self) -> bool {
        let labels = match store::scan_labels(&self.dir) {
            Ok(labels) => labels,
            Err(e) => {
                warn!(error = %e, "cannot scan record files");
                return false;
            }
        };
        let mut leaves = vec![EMPTY_LEAF_HASH; self.shape.num_labels() as usize];
        for &label in &labels {
            if label >= self.shape.num_labels() {
                warn!(label, "record file outside the label space");
                return false;
            }
            match store::read_record(&self.dir, label) {
                Ok(Some((mac, _))) => leaves[label as usize] = leaf_hash(&mac),
                Ok(None) => {}
                Err(_) => {
                    warn!(label, "record unreadable during regeneration, keeping cached hash");
                    leaves[label as usize] = self.layers[0][label as usize];
                }
            }
        }
        self.occupied = labels.into_iter().collect();
        self.layers = build_layers(self.shape, leaves);
        if let Err(e) = store::write_cache(&self.dir, self.shape, &self.layers[0]) {
            warn!(error = %e, "cache rewrite failed");
            return false;
        }
        true
    }

    /// destroy all persisted state and recreate an empty tree of the same shape
    pub fn reset(&mut self) -> bool {
        if let Err(e) = store::remove_all(&self.dir) {
            warn!(error = %e, "tree reset failed");
            return false;
        }
        self.occupied.clear();
        self.layers = build_layers(self.shape, vec![EMPTY_LEAF_HASH; self.shape.num_labels() as usize]);
        if let Err(e) = store::write_cache(&self.dir, self.shape, &self.layers[0]) {
            warn!(error = %e, "cache rewrite failed after reset");
            return false;
        }
        true
    }

    fn update_path(&mut self, value: u64, leaf: Hash) {
        let fanout = self.shape.fanout() as u64;
        self.layers[0][value as usize] = leaf;
        let mut index = value;
        for level in 1..=self.shape.height() as usize {
            let parent = index / fanout;
            let start = (parent * fanout) as usize;
            let hash = node_hash(&self.layers[level - 1][start..start + fanout as usize]);
            self.layers[level][parent as usize] = hash;
            index = parent;
        }
    }

    fn persist_cache(&self) {
        if let Err(e) = store::write_cache(&self.dir, self.shape, &self.layers[0]) {
            // recoverable: the next open regenerates from record files
            warn!(error = %e, "cache write failed");
        }
    }
}

/// build all inner layers from a full vector of leaf hashes
fn build_layers(shape: TreeShape, leaves: Vec<Hash>) -> Vec<Vec<Hash>> {
    let fanout = shape.fanout();
    let mut layers = vec![leaves];
    for level in 0..shape.height() as usize {
        let next: Vec<Hash> = layers[level].chunks_exact(fanout).map(node_hash).collect();
        layers.push(next);
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{empty_root, root_from_leaf};
    use proptest::prelude::*;

    fn small_shape() -> TreeShape {
        TreeShape::new(2, 3).unwrap()
    }

    fn open_tree(dir: &Path) -> HashTree {
        HashTree::open(dir, small_shape()).unwrap()
    }

    #[test]
    fn test_fresh_tree_has_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir.path().join("tree"));
        assert!(tree.freshly_created());
        assert!(tree.is_valid());
        assert_eq!(tree.root_hash(), empty_root(small_shape()));
    }

    #[test]
    fn test_store_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("tree"));
        let empty = tree.root_hash();
        let label = tree.get_free_label().unwrap();

        assert!(tree.store_record(label, b"mac bytes", b"meta bytes", false));
        assert_ne!(tree.root_hash(), empty);

        let record = tree.get_record(label);
        assert_eq!(record.mac, b"mac bytes");
        assert_eq!(record.metadata, b"meta bytes");
        assert!(!record.lost);

        assert!(tree.remove_record(label));
        assert_eq!(tree.root_hash(), empty);
        assert!(tree.get_record(label).metadata.is_empty());
    }

    #[test]
    fn test_absent_label_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir.path().join("tree"));
        let label = Label::new(13, small_shape()).unwrap();
        let record = tree.get_record(label);
        assert!(record.metadata.is_empty());
        assert!(!record.lost);
    }

    #[test]
    fn test_free_label_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let shape = TreeShape::new(1, 2).unwrap();
        let mut tree = HashTree::open(dir.path().join("tree"), shape).unwrap();
        for _ in 0..4 {
            let label = tree.get_free_label().unwrap();
            assert!(tree.store_record(label, b"m", b"d", false));
        }
        assert!(tree.get_free_label().is_none());
    }

    #[test]
    fn test_reopen_preserves_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree");
        let root = {
            let mut tree = open_tree(&path);
            let label = tree.get_free_label().unwrap();
            tree.store_record(label, b"mac", b"meta", false);
            tree.root_hash()
        };
        let tree = open_tree(&path);
        assert!(!tree.freshly_created());
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn test_corrupt_cache_regenerates_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree");
        let root = {
            let mut tree = open_tree(&path);
            let label = tree.get_free_label().unwrap();
            tree.store_record(label, b"mac", b"meta", false);
            tree.root_hash()
        };
        std::fs::write(path.join("hash_cache"), b"garbage").unwrap();
        let tree = open_tree(&path);
        assert!(tree.is_valid());
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn test_corrupt_record_reads_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree");
        let mut tree = open_tree(&path);
        let label = tree.get_free_label().unwrap();
        tree.store_record(label, b"mac", b"meta", false);
        let root = tree.root_hash();
        std::fs::write(path.join(label.value().to_string()), b"not json").unwrap();

        let tree = open_tree(&path);
        let record = tree.get_record(label);
        assert!(record.lost);
        // the cached leaf hash keeps the root consistent
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn test_aux_hash_count_and_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = open_tree(&dir.path().join("tree"));
        // occupy a few labels so the aux vector is not all zeros
        for _ in 0..5 {
            let label = tree.get_free_label().unwrap();
            tree.store_record(label, format!("mac{}", label.value()).as_bytes(), b"m", false);
        }
        let label = Label::new(2, small_shape()).unwrap();
        let aux = tree.get_aux_hashes(label).unwrap();
        // (fanout - 1) entries per level, for every level below the root
        assert_eq!(aux.len(), 3 * 3);

        let leaf = tree.layers[0][2];
        assert_eq!(root_from_leaf(label, leaf, &aux), Some(tree.root_hash()));
    }

    proptest! {
        #[test]
        fn prop_root_reconstructs_from_any_leaf(values in proptest::collection::vec(0u64..64, 1..10), probe in 0u64..64) {
            let dir = tempfile::tempdir().unwrap();
            let mut tree = open_tree(&dir.path().join("tree"));
            for v in values {
                let label = Label::new(v, small_shape()).unwrap();
                tree.store_record(label, format!("mac-{v}").as_bytes(), b"meta", false);
            }
            let label = Label::new(probe, small_shape()).unwrap();
            let aux = tree.get_aux_hashes(label).unwrap();
            let leaf = tree.layers[0][probe as usize];
            prop_assert_eq!(root_from_leaf(label, leaf, &aux), Some(tree.root_hash()));
        }
    }
}
