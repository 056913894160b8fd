use dashmap::DashSet;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rustc_hash::FxHashMap;

use crate::dag::color_pool::ColorPool;
use crate::dag::config::NodeConfig;
use crate::dag::node_pool::NodePool;
use crate::dag::pointer::{ColorPointer, ColorTag, NodePointer};
use crate::dag::DagError;

impl NodePool {
    /// Mark-sweep-compact: walks the DAG under `root`, rewrites every live
    /// node into a fresh shadow pool through normal upserts, swaps the
    /// shadow's pages in and returns the remapped root. Addresses held by
    /// the caller are invalidated; only the returned root is valid.
    ///
    /// Requires exclusive access, which the edit submission queue provides
    /// by running GC as just another serialized job.
    pub fn gc(&mut self, threads: &rayon::ThreadPool, root: NodePointer) -> Result<NodePointer, DagError> {
        let live = DashSet::new();
        threads.install(|| self.mark_rec(&live, 0, root));
        self.gc_marked(root, &live)
    }

    /// Sweep/compact against an already computed reachable set.
    fn gc_marked(&mut self, root: NodePointer, live: &DashSet<u32>) -> Result<NodePointer, DagError> {
        let shadow = NodePool::new(self.config().clone())?;
        let mut remap = FxHashMap::default();
        let new_root = self.compact_rec(&shadow, &mut remap, 0, root)?;
        debug_assert_eq!(remap.len(), live.len());

        log::info!(
            "gc: {} live nodes, {} -> {} resident pages",
            live.len(),
            self.store().resident_pages(),
            shadow.store().resident_pages(),
        );
        self.replace_with(shadow);
        Ok(new_root)
    }

    /// Parallel reachability walk. Tasks partition by octant subtree; the
    /// shared-subtree cut-off makes each address visited once.
    fn mark_rec(&self, live: &DashSet<u32>, level: u32, ptr: NodePointer) {
        let addr = match ptr.addr() {
            Some(addr) => addr,
            None => return,
        };
        if !live.insert(addr) || level == self.config().leaf_level() {
            return;
        }
        let children = self.children_of(ptr);
        if level < self.config().spawn_level() {
            (0..8usize)
                .into_par_iter()
                .for_each(|octant| self.mark_rec(live, level + 1, children[octant]));
        } else {
            for child in children {
                self.mark_rec(live, level + 1, child);
            }
        }
    }

    /// Root-down rewrite into the shadow pool. Children are emitted before
    /// their parent so the parent's words reference shadow addresses; the
    /// remap table keeps shared subtrees shared.
    fn compact_rec(
        &self,
        shadow: &NodePool,
        remap: &mut FxHashMap<u32, u32>,
        level: u32,
        ptr: NodePointer,
    ) -> Result<NodePointer, DagError> {
        let addr = match ptr.addr() {
            Some(addr) => addr,
            None => return Ok(ptr),
        };
        if let Some(&mapped) = remap.get(&addr) {
            return Ok(NodePointer::address(mapped));
        }

        let new_ptr = if level == self.config().leaf_level() {
            shadow.upsert_leaf(self.leaf_bits(ptr))?
        } else {
            let children = self.children_of(ptr);
            let mut new_children = [NodePointer::NULL; 8];
            for octant in 0..8 {
                new_children[octant] = self.compact_rec(shadow, remap, level + 1, children[octant])?;
            }
            shadow.upsert_children(level, &new_children)?
        };

        // stored nodes are never trivial, so the rebuild cannot normalize
        // them away
        debug_assert!(new_ptr.addr().is_some());
        if let Some(new_addr) = new_ptr.addr() {
            remap.insert(addr, new_addr);
        }
        Ok(new_ptr)
    }
}

impl ColorPool {
    /// Same three phases as the geometry GC: a parallel mark over the color
    /// octree, a sequential compact into fresh stores, then the page swap.
    /// Old pointers are invalidated; only the returned root is valid.
    pub fn gc(
        &mut self,
        threads: &rayon::ThreadPool,
        node_config: &NodeConfig,
        root: ColorPointer,
    ) -> Result<ColorPointer, DagError> {
        let live = DashSet::new();
        threads.install(|| self.mark_color_rec(&live, node_config, 0, root));
        self.gc_marked(node_config, root, &live)
    }

    /// Sweep/compact against an already computed reachable set.
    fn gc_marked(
        &mut self,
        node_config: &NodeConfig,
        root: ColorPointer,
        live: &DashSet<u32>,
    ) -> Result<ColorPointer, DagError> {
        let shadow = ColorPool::new(self.config().clone(), node_config)?;
        let mut node_remap = FxHashMap::default();
        let mut leaf_remap = FxHashMap::default();
        let new_root =
            self.compact_color(&shadow, &mut node_remap, &mut leaf_remap, node_config, root)?;
        debug_assert_eq!(node_remap.len() + leaf_remap.len(), live.len());

        log::info!(
            "color gc: {} nodes, {} leaves, {} -> {} used leaf words",
            node_remap.len(),
            leaf_remap.len(),
            self.leaves().used_words(),
            shadow.leaves().used_words(),
        );
        self.replace_with(shadow);
        Ok(new_root)
    }

    /// Parallel reachability walk over the color octree. Nodes and leaves
    /// share one set, keyed by their tagged pointer words.
    fn mark_color_rec(
        &self,
        live: &DashSet<u32>,
        node_config: &NodeConfig,
        level: u32,
        ptr: ColorPointer,
    ) {
        match ptr.tag() {
            ColorTag::Null | ColorTag::Solid => {}
            ColorTag::Leaf => {
                live.insert(ptr.to_word());
            }
            ColorTag::Node => {
                if !live.insert(ptr.to_word()) {
                    return;
                }
                let children = self.children_of(ptr);
                if level < node_config.spawn_level() {
                    (0..8usize).into_par_iter().for_each(|octant| {
                        self.mark_color_rec(live, node_config, level + 1, children[octant])
                    });
                } else {
                    for child in children {
                        self.mark_color_rec(live, node_config, level + 1, child);
                    }
                }
            }
        }
    }

    fn compact_color(
        &self,
        shadow: &ColorPool,
        node_remap: &mut FxHashMap<u32, u32>,
        leaf_remap: &mut FxHashMap<u32, u32>,
        node_config: &NodeConfig,
        ptr: ColorPointer,
    ) -> Result<ColorPointer, DagError> {
        match ptr.tag() {
            ColorTag::Null | ColorTag::Solid => Ok(ptr),
            ColorTag::Node => {
                if let Some(&mapped) = node_remap.get(&ptr.data()) {
                    return Ok(ColorPointer::node(mapped));
                }
                let children = self.children_of(ptr);
                let mut new_children = [ColorPointer::NULL; 8];
                for octant in 0..8 {
                    new_children[octant] = self.compact_color(
                        shadow,
                        node_remap,
                        leaf_remap,
                        node_config,
                        children[octant],
                    )?;
                }
                let new_ptr = shadow.add_node(&new_children)?;
                node_remap.insert(ptr.data(), new_ptr.data());
                Ok(new_ptr)
            }
            ColorTag::Leaf => {
                if let Some(&mapped) = leaf_remap.get(&ptr.data()) {
                    return Ok(ColorPointer::leaf(mapped));
                }
                let chunk = self.read_chunk(ptr, self.chunk_len(node_config));
                let new_ptr = shadow.set_leaf(ColorPointer::NULL, &chunk)?;
                leaf_remap.insert(ptr.data(), new_ptr.data());
                Ok(new_ptr)
            }
        }
    }
}

/// GC of a paired world. One fused mark descends both octrees in lock step,
/// so the color pass reuses the reachability gathered during the geometry
/// walk instead of re-walking the shared spatial structure. Compaction then
/// runs geometry first, colors second, all under the same exclusive borrows.
pub fn collect_garbage(
    nodes: &mut NodePool,
    colors: &mut ColorPool,
    threads: &rayon::ThreadPool,
    root: NodePointer,
    color_root: ColorPointer,
) -> Result<(NodePointer, ColorPointer), DagError> {
    let geometry_live = DashSet::new();
    let color_live = DashSet::new();
    threads.install(|| {
        mark_world_rec(nodes, colors, &geometry_live, &color_live, 0, root, color_root)
    });
    let new_root = nodes.gc_marked(root, &geometry_live)?;
    let new_color_root = colors.gc_marked(nodes.config(), color_root, &color_live)?;
    Ok((new_root, new_color_root))
}

/// Lock-step mark over both octrees. Each side cuts off at its own
/// already-visited subtrees; the walk continues as long as either side still
/// has something new below.
fn mark_world_rec(
    nodes: &NodePool,
    colors: &ColorPool,
    geometry_live: &DashSet<u32>,
    color_live: &DashSet<u32>,
    level: u32,
    ptr: NodePointer,
    color_ptr: ColorPointer,
) {
    let geometry_new = match ptr.addr() {
        Some(addr) => geometry_live.insert(addr),
        None => false,
    };
    let color_new = match color_ptr.tag() {
        ColorTag::Node | ColorTag::Leaf => color_live.insert(color_ptr.to_word()),
        _ => false,
    };

    // color Node entries only exist above the color leaf level, so either
    // descent implies an inner geometry level
    let descend_geometry = geometry_new && level < nodes.config().leaf_level();
    let descend_color = color_new && color_ptr.tag() == ColorTag::Node;
    if !descend_geometry && !descend_color {
        return;
    }

    let children = nodes.children_of(ptr);
    let color_children = match color_ptr.tag() {
        ColorTag::Node => colors.children_of(color_ptr),
        ColorTag::Leaf => [ColorPointer::NULL; 8],
        _ => [color_ptr; 8],
    };

    if level < nodes.config().spawn_level() {
        (0..8usize).into_par_iter().for_each(|octant| {
            mark_world_rec(
                nodes,
                colors,
                geometry_live,
                color_live,
                level + 1,
                children[octant],
                color_children[octant],
            )
        });
    } else {
        for octant in 0..8 {
            mark_world_rec(
                nodes,
                colors,
                geometry_live,
                color_live,
                level + 1,
                children[octant],
                color_children[octant],
            );
        }
    }
}

#[cfg(test)]
mod gc_tests {
    use cgmath::Vector3;

    use super::*;
    use crate::dag::config::ColorConfig;
    use crate::dag::editors::{AabbEditor, SphereEditor};
    use crate::dag::paged::PageOp;
    use crate::dag::tests::{small_config, test_threads};
    use crate::dag::vbr::{RGB8Color, VBRColor};

    #[test]
    fn gc_preserves_geometry() {
        let mut pool = NodePool::new(small_config()).unwrap();
        let threads = test_threads();

        let editor = SphereEditor::fill(Vector3::new(8, 8, 8), 6, VBRColor::solid(RGB8Color(0xFF0000)));
        let root = pool.edit(&threads, NodePointer::NULL, &editor).unwrap();
        pool.set_root(root);

        let before: Vec<bool> = (0..16u32 * 16 * 16)
            .map(|i| pool.get_voxel(root, Vector3::new(i % 16, i / 16 % 16, i / 256)))
            .collect();

        let new_root = pool.gc(&threads, root).unwrap();
        pool.set_root(new_root);

        let after: Vec<bool> = (0..16u32 * 16 * 16)
            .map(|i| pool.get_voxel(new_root, Vector3::new(i % 16, i / 16 % 16, i / 256)))
            .collect();
        assert_eq!(before, after);
    }

    /// Orphaned nodes from superseded edits are dropped and their pages
    /// unbound at the next flush.
    #[test]
    fn gc_drops_garbage_pages() {
        let mut pool = NodePool::new(small_config()).unwrap();
        let threads = test_threads();

        // leave a trail of superseded roots
        let mut root = NodePointer::NULL;
        for radius in [3u32, 4, 5, 6, 7] {
            let editor =
                SphereEditor::fill(Vector3::new(8, 8, 8), radius, VBRColor::solid(RGB8Color(0x0000FF)));
            root = pool.edit(&threads, root, &editor).unwrap();
        }
        let mut ops: Vec<PageOp> = Vec::new();
        pool.flush(&mut ops);

        let words_before = pool.total_used_words();
        root = pool.gc(&threads, root).unwrap();
        assert!(pool.total_used_words() < words_before);

        // fresh equivalent world for comparison
        let fresh = NodePool::new(small_config()).unwrap();
        let editor = SphereEditor::fill(Vector3::new(8, 8, 8), 7, VBRColor::solid(RGB8Color(0x0000FF)));
        let fresh_root = fresh.edit(&threads, NodePointer::NULL, &editor).unwrap();
        assert_eq!(pool.total_used_words(), fresh.total_used_words());

        for i in 0..16u32 * 16 * 16 {
            let pos = Vector3::new(i % 16, i / 16 % 16, i / 256);
            assert_eq!(pool.get_voxel(root, pos), fresh.get_voxel(fresh_root, pos));
        }

        let mut ops: Vec<PageOp> = Vec::new();
        pool.flush(&mut ops);
        assert!(ops.iter().any(|op| matches!(op, PageOp::Unbind { .. })));
    }

    /// Standalone color GC: the parallel mark plus compact must preserve
    /// every color and drop slots orphaned by history-keeping rewrites.
    #[test]
    fn color_gc_preserves_colors() {
        let config = small_config();
        // leaf level 1 gives the color tree real inner nodes; keep_history
        // makes every leaf rewrite allocate a fresh slot, leaving garbage
        let color_config = ColorConfig {
            leaf_level: 1,
            node_bits_per_node_page: 4,
            word_bits_per_leaf_page: 8,
            keep_history: true,
        };
        let pool = NodePool::new(config.clone()).unwrap();
        let mut colors = ColorPool::new(color_config, &config).unwrap();
        let threads = test_threads();

        let mut root = NodePointer::NULL;
        let mut color_root = ColorPointer::NULL;
        for (max, color) in [(7u32, 0xFF0000u32), (9, 0x00FF00), (11, 0x0000FF)] {
            let editor = AabbEditor {
                min: Vector3::new(1, 1, 1),
                max: Vector3::new(max, max, max),
                color: VBRColor::solid(RGB8Color(color)),
            };
            let (new_root, new_color_root) = pool
                .edit_with_colors(&threads, root, &colors, color_root, &editor)
                .unwrap();
            root = new_root;
            color_root = new_color_root;
        }

        let before: Vec<Option<RGB8Color>> = (0..16u32 * 16 * 16)
            .map(|i| {
                colors.get_color(&config, color_root, Vector3::new(i % 16, i / 16 % 16, i / 256))
            })
            .collect();
        let words_before = colors.leaves().used_words();

        let new_color_root = colors.gc(&threads, &config, color_root).unwrap();

        let after: Vec<Option<RGB8Color>> = (0..16u32 * 16 * 16)
            .map(|i| {
                colors.get_color(&config, new_color_root, Vector3::new(i % 16, i / 16 % 16, i / 256))
            })
            .collect();
        assert_eq!(before, after);
        assert!(colors.leaves().used_words() < words_before);
    }
}
