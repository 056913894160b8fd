use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};

use cgmath::Vector3;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::dag::config::NodeConfig;
use crate::dag::paged::{PageBackend, PagedStore};
use crate::dag::pointer::NodePointer;
use crate::dag::DagError;

/// Largest node: childmask word plus 8 child pointers.
pub const MAX_NODE_WORDS: usize = 9;
/// Leaves pack a 4x4x4 voxel block into two words.
pub const LEAF_WORDS: usize = 2;

/// Hash-consed storage for the geometry octree.
///
/// Nodes are stored by word address in a [`PagedStore`] that is partitioned
/// into per-level bucket ranges; a node's bucket is chosen by hashing its
/// words. Inserting is always insert-or-find: the bucket prefix is scanned
/// for a structurally identical node before appending, so equal subtrees
/// share one address and pointer equality is structural equality.
///
/// An inner node is `[childmask : u8 | reserved : u24]` followed by one
/// pointer word per set mask bit. A mask bit marks a non-Null child; Filled
/// children additionally carry the Filled sentinel in their pointer word.
/// All-empty and all-filled candidates are never stored, they normalize to
/// the `NULL` / `FILLED` sentinels instead.
pub struct NodePool {
    config: NodeConfig,
    store: PagedStore,
    /// Published word count per bucket. Stores happen-before the release
    /// here; scans acquire it, which makes the unlocked prefix scan safe.
    bucket_words: Box<[AtomicU32]>,
    bucket_locks: Box<[Mutex<()>]>,
    root: AtomicU32,
}

impl NodePool {
    pub fn new(config: NodeConfig) -> Result<Self, DagError> {
        config.validate()?;
        let buckets = config.total_buckets() as usize;
        Ok(NodePool {
            store: PagedStore::new(config.word_bits_per_page, config.total_pages()),
            bucket_words: (0..buckets).map(|_| AtomicU32::new(0)).collect(),
            bucket_locks: (0..buckets).map(|_| Mutex::new(())).collect(),
            root: AtomicU32::new(NodePointer::NULL.to_word()),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline]
    pub fn store(&self) -> &PagedStore {
        &self.store
    }

    #[inline]
    pub fn get_root(&self) -> NodePointer {
        NodePointer::from_word(self.root.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_root(&self, root: NodePointer) {
        self.root.store(root.to_word(), Ordering::Release);
    }

    /// Words occupied across all buckets; zero for a pool that stores
    /// nothing but sentinel roots.
    pub fn total_used_words(&self) -> u64 {
        self.bucket_words.iter().map(|w| w.load(Ordering::Relaxed) as u64).sum()
    }

    #[inline]
    fn node_size(&self, level: u32, first_word: u32) -> u32 {
        if level == self.config.leaf_level() {
            LEAF_WORDS as u32
        } else {
            1 + (first_word & 0xFF).count_ones()
        }
    }

    fn bucket_of(&self, level: u32, words: &[u32]) -> u32 {
        let mut hasher = FxHasher::default();
        for &word in words {
            hasher.write_u32(word);
        }
        let index = (hasher.finish() % self.config.buckets_at_level(level) as u64) as u32;
        self.config.bucket_base(level) + index
    }

    /// Walks the bucket's node sequence in `[from, to)` (word offsets within
    /// the bucket, both at node boundaries) and returns the address of a
    /// node equal to `words`, if present.
    fn scan_bucket(&self, level: u32, bucket_base: u32, from: u32, to: u32, words: &[u32]) -> Option<NodePointer> {
        let mut addr = bucket_base + from;
        let end = bucket_base + to;
        while addr < end {
            let first = self.store.read_word(addr);
            let size = self.node_size(level, first);
            if size as usize == words.len() && first == words[0] {
                let matches = (1..words.len()).all(|i| self.store.read_word(addr + i as u32) == words[i]);
                if matches {
                    return Some(NodePointer::address(addr));
                }
            }
            addr += size;
        }
        None
    }

    /// Insert-or-find. Scans the published bucket prefix without the lock
    /// first; a racing insert can at worst land in the same bucket's tail,
    /// which the locked re-scan of `[snapshot, used)` covers before
    /// appending.
    fn upsert(&self, level: u32, words: &[u32]) -> Result<NodePointer, DagError> {
        debug_assert!(level <= self.config.leaf_level());
        debug_assert!(words.len() >= 2 && words.len() <= MAX_NODE_WORDS);

        let bucket = self.bucket_of(level, words);
        let base = bucket << (self.config.word_bits_per_page + self.config.page_bits_per_bucket);

        let snapshot = self.bucket_words[bucket as usize].load(Ordering::Acquire);
        if let Some(existing) = self.scan_bucket(level, base, 0, snapshot, words) {
            return Ok(existing);
        }

        let _guard = self.bucket_locks[bucket as usize].lock();
        let used = self.bucket_words[bucket as usize].load(Ordering::Relaxed);
        if let Some(existing) = self.scan_bucket(level, base, snapshot, used, words) {
            return Ok(existing);
        }

        if used + words.len() as u32 > self.config.words_per_bucket() {
            return Err(DagError::OutOfBuckets { level, bucket });
        }
        self.store.write_words(base + used, words);
        self.bucket_words[bucket as usize].store(used + words.len() as u32, Ordering::Release);
        Ok(NodePointer::address(base + used))
    }

    /// Upserts an inner node built from its 8 child pointers, normalizing
    /// the all-empty and all-filled cases to sentinels.
    pub fn upsert_children(&self, level: u32, children: &[NodePointer; 8]) -> Result<NodePointer, DagError> {
        debug_assert!(level < self.config.leaf_level());

        let mut words = [0u32; MAX_NODE_WORDS];
        let mut mask = 0u32;
        let mut len = 1;
        let mut all_filled = true;
        for (octant, &child) in children.iter().enumerate() {
            if !child.is_null() {
                mask |= 1 << octant;
                words[len] = child.to_word();
                len += 1;
            }
            all_filled &= child.is_filled();
        }

        if mask == 0 {
            return Ok(NodePointer::NULL);
        }
        if all_filled {
            return Ok(NodePointer::FILLED);
        }
        words[0] = mask;
        self.upsert(level, &words[..len])
    }

    /// Upserts a 4x4x4 leaf, normalizing all-zeros to Null and all-ones to
    /// Filled.
    pub fn upsert_leaf(&self, bits: u64) -> Result<NodePointer, DagError> {
        if bits == 0 {
            return Ok(NodePointer::NULL);
        }
        if bits == u64::MAX {
            return Ok(NodePointer::FILLED);
        }
        self.upsert(self.config.leaf_level(), &[bits as u32, (bits >> 32) as u32])
    }

    /// Child pointer of a stored inner node. Sentinel parents propagate to
    /// their children without touching the store.
    pub fn child_of(&self, ptr: NodePointer, octant: u32) -> NodePointer {
        let addr = match ptr.addr() {
            Some(addr) => addr,
            None => return ptr,
        };
        let mask = self.store.read_word(addr) & 0xFF;
        if mask & (1 << octant) == 0 {
            return NodePointer::NULL;
        }
        let rank = (mask & ((1 << octant) - 1)).count_ones();
        NodePointer::from_word(self.store.read_word(addr + 1 + rank))
    }

    /// All 8 children of a stored inner node.
    pub fn children_of(&self, ptr: NodePointer) -> [NodePointer; 8] {
        let addr = match ptr.addr() {
            Some(addr) => addr,
            None => return [ptr; 8],
        };
        let mask = self.store.read_word(addr) & 0xFF;
        let mut children = [NodePointer::NULL; 8];
        let mut next = addr + 1;
        for (octant, child) in children.iter_mut().enumerate() {
            if mask & (1 << octant) != 0 {
                *child = NodePointer::from_word(self.store.read_word(next));
                next += 1;
            }
        }
        children
    }

    /// The 64 occupancy bits of a leaf pointer.
    pub fn leaf_bits(&self, ptr: NodePointer) -> u64 {
        match ptr.addr() {
            Some(addr) => {
                self.store.read_word(addr) as u64 | ((self.store.read_word(addr + 1) as u64) << 32)
            }
            None if ptr.is_filled() => u64::MAX,
            None => 0,
        }
    }

    /// Single-voxel occupancy query.
    pub fn get_voxel(&self, root: NodePointer, pos: Vector3<u32>) -> bool {
        let mut ptr = root;
        for level in 0..self.config.leaf_level() {
            if ptr.is_null() {
                return false;
            }
            if ptr.is_filled() {
                return true;
            }
            let shift = self.config.voxel_level() - level - 1;
            let octant =
                ((pos.x >> shift) & 1) | (((pos.y >> shift) & 1) << 1) | (((pos.z >> shift) & 1) << 2);
            ptr = self.child_of(ptr, octant);
        }
        if ptr.is_null() {
            return false;
        }
        if ptr.is_filled() {
            return true;
        }
        let upper = (pos.x >> 1 & 1) | ((pos.y >> 1 & 1) << 1) | ((pos.z >> 1 & 1) << 2);
        let lower = (pos.x & 1) | ((pos.y & 1) << 1) | ((pos.z & 1) << 2);
        self.leaf_bits(ptr) >> (upper * 8 + lower) & 1 != 0
    }

    /// Emits the dirty-page diff accumulated since the last flush.
    pub fn flush(&mut self, backend: &mut dyn PageBackend) {
        self.store.flush(backend);
    }

    /// Installs the state of a GC shadow pool; see
    /// [`PagedStore::replace_with`]. The caller re-targets the root.
    pub(crate) fn replace_with(&mut self, shadow: NodePool) {
        self.bucket_words = shadow.bucket_words;
        self.store.replace_with(shadow.store);
    }

    /// Enumerates `(address, words)` of every node in one bucket, in
    /// insertion order.
    pub(crate) fn nodes_in_bucket(&self, level: u32, bucket: u32) -> Vec<(u32, Vec<u32>)> {
        let base = bucket << (self.config.word_bits_per_page + self.config.page_bits_per_bucket);
        let used = self.bucket_words[bucket as usize].load(Ordering::Acquire);
        let mut nodes = Vec::new();
        let mut addr = base;
        while addr < base + used {
            let size = self.node_size(level, self.store.read_word(addr));
            let mut words = vec![0u32; size as usize];
            self.store.read_words(addr, &mut words);
            nodes.push((addr, words));
            addr += size;
        }
        nodes
    }
}

#[cfg(test)]
mod node_pool_tests {
    use super::*;
    use crate::dag::tests::small_config;

    #[test]
    fn upsert_is_insert_or_find() {
        let pool = NodePool::new(small_config()).unwrap();

        let leaf_a = pool.upsert_leaf(0x00FF_00FF_0000_FFFF).unwrap();
        let leaf_b = pool.upsert_leaf(0x00FF_00FF_0000_FFFF).unwrap();
        assert_eq!(leaf_a, leaf_b);

        let other = pool.upsert_leaf(0xAAAA_0000_0000_0001).unwrap();
        assert_ne!(leaf_a, other);

        let level = small_config().leaf_level() - 1;
        let children = |leaf| {
            let mut c = [NodePointer::NULL; 8];
            c[3] = leaf;
            c[7] = NodePointer::FILLED;
            c
        };
        let node_a = pool.upsert_children(level, &children(leaf_a)).unwrap();
        let node_b = pool.upsert_children(level, &children(leaf_b)).unwrap();
        assert_eq!(node_a, node_b);

        assert_eq!(pool.child_of(node_a, 3), leaf_a);
        assert_eq!(pool.child_of(node_a, 7), NodePointer::FILLED);
        assert_eq!(pool.child_of(node_a, 0), NodePointer::NULL);
    }

    #[test]
    fn candidates_normalize_to_sentinels() {
        let pool = NodePool::new(small_config()).unwrap();
        let level = small_config().leaf_level() - 1;

        assert_eq!(pool.upsert_leaf(0).unwrap(), NodePointer::NULL);
        assert_eq!(pool.upsert_leaf(u64::MAX).unwrap(), NodePointer::FILLED);
        assert_eq!(
            pool.upsert_children(level, &[NodePointer::NULL; 8]).unwrap(),
            NodePointer::NULL
        );
        assert_eq!(
            pool.upsert_children(level, &[NodePointer::FILLED; 8]).unwrap(),
            NodePointer::FILLED
        );
        assert_eq!(pool.total_used_words(), 0);
    }

    #[test]
    fn voxel_query_follows_the_tree() {
        let config = small_config();
        let pool = NodePool::new(config.clone()).unwrap();

        // one voxel at (0, 0, 0): leaf bit 0, octant 0 all the way up
        let leaf = pool.upsert_leaf(1).unwrap();
        let mut ptr = leaf;
        for level in (0..config.leaf_level()).rev() {
            let mut children = [NodePointer::NULL; 8];
            children[0] = ptr;
            ptr = pool.upsert_children(level, &children).unwrap();
        }

        assert!(pool.get_voxel(ptr, Vector3::new(0, 0, 0)));
        assert!(!pool.get_voxel(ptr, Vector3::new(1, 0, 0)));
        assert!(!pool.get_voxel(ptr, Vector3::new(0, 4, 0)));
        assert!(!pool.get_voxel(NodePointer::NULL, Vector3::new(0, 0, 0)));
        assert!(pool.get_voxel(NodePointer::FILLED, Vector3::new(13, 2, 7)));
    }

    #[test]
    fn bucket_capacity_is_surfaced() {
        // 2 words per page, 1 page per bucket, 1 bucket per level: each
        // bucket holds exactly one leaf
        let config = NodeConfig {
            level_count: 3,
            top_level_count: 1,
            word_bits_per_page: 1,
            page_bits_per_bucket: 0,
            bucket_bits_per_top_level: 0,
            bucket_bits_per_bottom_level: 0,
        };
        let pool = NodePool::new(config).unwrap();

        let first = pool.upsert_leaf(0x1234_5678_9ABC_DEF0).unwrap();
        assert!(first.addr().is_some());
        // the same leaf is found, not re-inserted
        assert_eq!(pool.upsert_leaf(0x1234_5678_9ABC_DEF0).unwrap(), first);
        // a different leaf no longer fits
        match pool.upsert_leaf(0x0F0F_0F0F_0F0F_0F0F) {
            Err(DagError::OutOfBuckets { level, .. }) => assert_eq!(level, 1),
            other => panic!("expected OutOfBuckets, got {:?}", other),
        }
    }

    /// Concurrent upserts of the same candidates must agree on addresses.
    #[test]
    fn concurrent_upserts_deduplicate() {
        use std::sync::Arc;

        let pool = Arc::new(NodePool::new(small_config()).unwrap());
        let bits: Vec<u64> = (1..64u64)
            .map(|i| i.wrapping_mul(0x0101_0303_0707_0F0F) ^ i)
            .collect();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let bits = bits.clone();
            handles.push(std::thread::spawn(move || {
                bits.iter().map(|&b| pool.upsert_leaf(b).unwrap()).collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<NodePointer>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }

        // no bucket contains two identical nodes
        let config = small_config();
        for level in 0..=config.leaf_level() {
            for bucket in 0..config.buckets_at_level(level) {
                let nodes = pool.nodes_in_bucket(level, config.bucket_base(level) + bucket);
                for (i, (_, a)) in nodes.iter().enumerate() {
                    for (_, b) in &nodes[i + 1..] {
                        assert_ne!(a, b, "duplicate node in bucket");
                    }
                }
            }
        }
    }
}
