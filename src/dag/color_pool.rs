use std::sync::atomic::{AtomicU32, Ordering};

use cgmath::Vector3;

use crate::dag::config::{ColorConfig, NodeConfig};
use crate::dag::coord::morton_encode;
use crate::dag::paged::{PageBackend, PagedVec};
use crate::dag::pointer::{ColorPointer, ColorTag};
use crate::dag::vbr::{RGB8Color, VBRChunk};
use crate::dag::DagError;

/// Words per color node: 8 tagged child pointers.
const NODE_WORDS: u32 = 8;
/// Word capacity of either store; bounded by the 30-bit pointer payload.
const STORE_CAPACITY_WORDS: u32 = 1 << 30;
/// Page-table bound per store; small-page configurations trade capacity for
/// page granularity instead of growing the table.
const MAX_STORE_PAGES: u32 = 4096;

/// The color octree, stored in two append-only paged vectors: fixed-size
/// inner nodes and size-prefixed variable-length VBR leaf slots.
///
/// A leaf at `leaf_level` encodes, in Morton order, the colors of every
/// voxel in its cube. Entries are immutable once published, with one
/// exception: with `keep_history` off, rewriting a leaf reuses its slot when
/// the new chunk fits the slot's recorded capacity.
pub struct ColorPool {
    config: ColorConfig,
    nodes: PagedVec,
    leaves: PagedVec,
    root: AtomicU32,
}

impl ColorPool {
    pub fn new(config: ColorConfig, node_config: &NodeConfig) -> Result<Self, DagError> {
        config.validate(node_config)?;
        let store = |word_bits: u32| {
            let pages = (STORE_CAPACITY_WORDS >> word_bits).clamp(1, MAX_STORE_PAGES);
            PagedVec::new(word_bits, pages, pages << word_bits)
        };
        Ok(ColorPool {
            nodes: store(config.node_bits_per_node_page + 3),
            leaves: store(config.word_bits_per_leaf_page),
            root: AtomicU32::new(ColorPointer::NULL.to_word()),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    #[inline]
    pub fn leaf_level(&self) -> u32 {
        self.config.leaf_level
    }

    #[inline]
    pub fn get_root(&self) -> ColorPointer {
        ColorPointer::from_word(self.root.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_root(&self, root: ColorPointer) {
        self.root.store(root.to_word(), Ordering::Release);
    }

    #[inline]
    pub fn nodes(&self) -> &PagedVec {
        &self.nodes
    }

    #[inline]
    pub fn leaves(&self) -> &PagedVec {
        &self.leaves
    }

    /// Voxel count covered by one leaf chunk.
    #[inline]
    pub fn chunk_len(&self, node_config: &NodeConfig) -> u64 {
        1u64 << (3 * (node_config.voxel_level() - self.config.leaf_level))
    }

    /// Appends an inner node. Color nodes are not hash-consed; sharing
    /// arises from edits reusing child pointers wholesale.
    pub fn add_node(&self, children: &[ColorPointer; 8]) -> Result<ColorPointer, DagError> {
        let mut words = [0u32; NODE_WORDS as usize];
        for (word, child) in words.iter_mut().zip(children) {
            *word = child.to_word();
        }
        let addr = self.nodes.append(&words).ok_or(DagError::OutOfPages)?;
        Ok(ColorPointer::node(addr / NODE_WORDS))
    }

    /// Normalizes 8 child pointers into a single subtree pointer: merged
    /// sentinel/solid forms where possible, a fresh node otherwise.
    pub fn make_node(&self, children: &[ColorPointer; 8]) -> Result<ColorPointer, DagError> {
        let first = children[0];
        if children.iter().all(|&c| c == first) {
            match first.tag() {
                ColorTag::Null | ColorTag::Solid => return Ok(first),
                _ => {}
            }
        }
        self.add_node(children)
    }

    pub fn children_of(&self, ptr: ColorPointer) -> [ColorPointer; 8] {
        debug_assert_eq!(ptr.tag(), ColorTag::Node);
        let base = ptr.data() * NODE_WORDS;
        let mut words = [0u32; NODE_WORDS as usize];
        self.nodes.store().read_words(base, &mut words);
        words.map(ColorPointer::from_word)
    }

    /// Reads the chunk behind a leaf pointer. `len` is the voxel count of
    /// the leaf's cube.
    pub fn read_chunk(&self, ptr: ColorPointer, len: u64) -> VBRChunk {
        debug_assert_eq!(ptr.tag(), ColorTag::Leaf);
        let base = ptr.data() + 1;
        let mut header = [0u32; 3];
        self.leaves.store().read_words(base, &mut header);
        let word_len = 3
            + 2 * header[1] as usize
            + 3 * header[0] as usize
            + (header[2] as u64).div_ceil(32) as usize;
        let mut words = vec![0u32; word_len];
        self.leaves.store().read_words(base, &mut words);
        VBRChunk::from_words(&words, len)
    }

    /// Writes a chunk into a leaf slot and returns its pointer.
    ///
    /// Without `keep_history`, a previous leaf slot is reused in place when
    /// the new chunk fits its capacity; an unchanged chunk is detected there
    /// and skipped entirely so repeated identical edits stay diff-free.
    pub fn set_leaf(&self, prev: ColorPointer, chunk: &VBRChunk) -> Result<ColorPointer, DagError> {
        let words = chunk.to_words();
        if !self.config.keep_history && prev.tag() == ColorTag::Leaf {
            let base = prev.data();
            let capacity = self.leaves.store().read_word(base);
            if words.len() as u32 <= capacity {
                let mut existing = vec![0u32; words.len()];
                self.leaves.store().read_words(base + 1, &mut existing);
                if existing != words {
                    self.leaves.store().write_words(base + 1, &words);
                }
                return Ok(prev);
            }
        }

        let mut slot = Vec::with_capacity(words.len() + 1);
        slot.push(words.len() as u32);
        slot.extend_from_slice(&words);
        let addr = self.leaves.append(&slot).ok_or(DagError::OutOfPages)?;
        Ok(ColorPointer::leaf(addr))
    }

    /// Single-voxel color query; `None` for voxels without color.
    pub fn get_color(
        &self,
        node_config: &NodeConfig,
        root: ColorPointer,
        pos: Vector3<u32>,
    ) -> Option<RGB8Color> {
        let mut ptr = root;
        let mut level = 0;
        while level < self.config.leaf_level && ptr.tag() == ColorTag::Node {
            let shift = node_config.voxel_level() - level - 1;
            let octant =
                ((pos.x >> shift) & 1) | (((pos.y >> shift) & 1) << 1) | (((pos.z >> shift) & 1) << 2);
            ptr = self.children_of(ptr)[octant as usize];
            level += 1;
        }
        match ptr.tag() {
            ColorTag::Null => None,
            ColorTag::Solid => ptr.solid_color(),
            ColorTag::Leaf => {
                let cube_bits = node_config.voxel_level() - self.config.leaf_level;
                let mask = (1u32 << cube_bits) - 1;
                let local = Vector3::new(pos.x & mask, pos.y & mask, pos.z & mask);
                let chunk = self.read_chunk(ptr, self.chunk_len(node_config));
                Some(chunk.reader().decode(morton_encode(local, cube_bits)))
            }
            // inner nodes end above the leaf level by construction
            ColorTag::Node => unreachable!("color node below leaf level"),
        }
    }

    /// Emits the dirty-page diffs of both stores. Node and leaf pages live
    /// in separate address spaces, hence separate backends.
    pub fn flush(&mut self, node_backend: &mut dyn PageBackend, leaf_backend: &mut dyn PageBackend) {
        self.nodes.store_mut().flush(node_backend);
        self.leaves.store_mut().flush(leaf_backend);
    }

    /// Installs the state of a GC shadow pool. The caller re-targets the
    /// root.
    pub(crate) fn replace_with(&mut self, shadow: ColorPool) {
        self.nodes.replace_with(shadow.nodes);
        self.leaves.replace_with(shadow.leaves);
    }
}
