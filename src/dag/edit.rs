use cgmath::Vector3;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::dag::color_pool::ColorPool;
use crate::dag::config::NodeConfig;
use crate::dag::coord::NodeCoord;
use crate::dag::node_pool::NodePool;
use crate::dag::pointer::{ColorPointer, ColorTag, NodePointer};
use crate::dag::vbr::{RGB8Color, VBRChunkWriter, VBRColor, VBRCursor};
use crate::dag::DagError;

/// Per-subtree verdict of an editor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EditDecision {
    /// Keep the subtree as is; recursion stops here.
    Unaffected,
    /// Replace the subtree with Null.
    Clear,
    /// Replace the subtree with Filled.
    Fill,
    /// Descend into children (or voxels, at the leaf level).
    Proceed,
}

/// A geometry edit. Implementations classify whole subtrees wherever they
/// can; `edit_voxel` only runs for leaves the editor chose to descend into.
///
/// Editors must be pure: they are invoked concurrently from the worker pool
/// and must not touch pool state.
pub trait Editor: Sync {
    fn edit_node(&self, config: &NodeConfig, coord: NodeCoord, ptr: NodePointer) -> EditDecision;
    fn edit_voxel(&self, config: &NodeConfig, coord: NodeCoord, voxel: bool) -> bool;
}

/// A fused geometry + color edit. The color argument threads through both
/// methods: on entry it carries the subtree's known uniform color (if any),
/// on exit the editor's verdict for it.
pub trait VBREditor: Editor {
    fn edit_node_color(
        &self,
        config: &NodeConfig,
        coord: NodeCoord,
        ptr: NodePointer,
        color: &mut Option<VBRColor>,
    ) -> EditDecision;

    fn edit_voxel_color(
        &self,
        config: &NodeConfig,
        coord: NodeCoord,
        voxel: bool,
        color: &mut VBRColor,
    ) -> bool;
}

// -------------------------------------------------------------------------------------------------

/// Colors feeding a chunk rewrite: the previous leaf's decoded stream, or a
/// constant for Solid/Null subtrees.
enum ColorSource<'a> {
    Chunk(VBRCursor<'a>),
    Constant(RGB8Color),
}

impl ColorSource<'_> {
    fn next(&mut self) -> RGB8Color {
        match self {
            ColorSource::Chunk(cursor) => cursor.next(),
            ColorSource::Constant(color) => *color,
        }
    }

    fn skip(&mut self, count: u64) {
        if let ColorSource::Chunk(cursor) = self {
            cursor.skip(count);
        }
    }

    fn copy_to(&mut self, writer: &mut VBRChunkWriter, count: u64) {
        match self {
            ColorSource::Constant(color) => writer.append_run(*color, count),
            ColorSource::Chunk(cursor) => {
                for _ in 0..count {
                    writer.append(cursor.next().into());
                }
            }
        }
    }
}

impl NodePool {
    /// Applies an editor to the subtree under `root` and returns the new
    /// root. Recursion fans out on the worker pool above the spawn level;
    /// child results are joined before each parent node is constructed, so
    /// the returned pointer is fully published.
    pub fn edit<E: Editor>(
        &self,
        threads: &rayon::ThreadPool,
        root: NodePointer,
        editor: &E,
    ) -> Result<NodePointer, DagError> {
        threads.install(|| self.edit_node_rec(editor, NodeCoord::root(), root))
    }

    /// Applies a fused geometry + color edit, descending both octrees in
    /// lock step, and returns the new root pair.
    pub fn edit_with_colors<E: VBREditor>(
        &self,
        threads: &rayon::ThreadPool,
        root: NodePointer,
        colors: &ColorPool,
        color_root: ColorPointer,
        editor: &E,
    ) -> Result<(NodePointer, ColorPointer), DagError> {
        threads.install(|| self.vbr_node_rec(editor, colors, NodeCoord::root(), root, color_root))
    }

    fn edit_node_rec<E: Editor>(
        &self,
        editor: &E,
        coord: NodeCoord,
        ptr: NodePointer,
    ) -> Result<NodePointer, DagError> {
        match editor.edit_node(self.config(), coord, ptr) {
            EditDecision::Unaffected => Ok(ptr),
            EditDecision::Clear => Ok(NodePointer::NULL),
            EditDecision::Fill => Ok(NodePointer::FILLED),
            EditDecision::Proceed if coord.level == self.config().leaf_level() => {
                self.edit_leaf(editor, coord, ptr)
            }
            EditDecision::Proceed => {
                let children = self.children_of(ptr);
                let results = if coord.level < self.config().spawn_level() {
                    let collected: Vec<Result<NodePointer, DagError>> = (0..8u32)
                        .into_par_iter()
                        .map(|octant| {
                            self.edit_node_rec(editor, coord.child(octant), children[octant as usize])
                        })
                        .collect();
                    let mut results = [NodePointer::NULL; 8];
                    for (octant, result) in collected.into_iter().enumerate() {
                        results[octant] = result?;
                    }
                    results
                } else {
                    let mut results = [NodePointer::NULL; 8];
                    for octant in 0..8u32 {
                        results[octant as usize] =
                            self.edit_node_rec(editor, coord.child(octant), children[octant as usize])?;
                    }
                    results
                };
                self.upsert_children(coord.level, &results)
            }
        }
    }

    fn edit_leaf<E: Editor>(
        &self,
        editor: &E,
        coord: NodeCoord,
        ptr: NodePointer,
    ) -> Result<NodePointer, DagError> {
        let config = self.config();
        let old = self.leaf_bits(ptr);
        let mut bits = 0u64;
        for upper in 0..8u32 {
            for lower in 0..8u32 {
                let index = upper * 8 + lower;
                let voxel_coord = leaf_voxel_coord(config, coord, upper, lower);
                if editor.edit_voxel(config, voxel_coord, old >> index & 1 != 0) {
                    bits |= 1 << index;
                }
            }
        }
        self.upsert_leaf(bits)
    }

    fn vbr_node_rec<E: VBREditor>(
        &self,
        editor: &E,
        colors: &ColorPool,
        coord: NodeCoord,
        ptr: NodePointer,
        color_ptr: ColorPointer,
    ) -> Result<(NodePointer, ColorPointer), DagError> {
        let config = self.config();
        let mut fill = color_ptr.solid_color().map(VBRColor::solid);
        let decision = editor.edit_node_color(config, coord, ptr, &mut fill);
        match decision {
            EditDecision::Clear => Ok((NodePointer::NULL, ColorPointer::NULL)),
            EditDecision::Unaffected | EditDecision::Fill => {
                let geometry = if decision == EditDecision::Fill {
                    NodePointer::FILLED
                } else {
                    ptr
                };
                // an empty subtree carries no color, a recolored one
                // collapses to Solid
                let color = if geometry.is_null() {
                    ColorPointer::NULL
                } else if let Some(fill) = fill {
                    ColorPointer::solid(fill.decode())
                } else {
                    color_ptr
                };
                Ok((geometry, color))
            }
            EditDecision::Proceed if coord.level == colors.leaf_level() => {
                self.vbr_chunk_rewrite(editor, colors, coord, ptr, color_ptr)
            }
            EditDecision::Proceed => {
                let children = self.children_of(ptr);
                let color_children = match color_ptr.tag() {
                    ColorTag::Node => colors.children_of(color_ptr),
                    // Null and Solid subtrees distribute to their children
                    _ => [color_ptr; 8],
                };

                let results = if coord.level < config.spawn_level() {
                    let collected: Vec<Result<(NodePointer, ColorPointer), DagError>> = (0..8u32)
                        .into_par_iter()
                        .map(|octant| {
                            self.vbr_node_rec(
                                editor,
                                colors,
                                coord.child(octant),
                                children[octant as usize],
                                color_children[octant as usize],
                            )
                        })
                        .collect();
                    let mut results = [(NodePointer::NULL, ColorPointer::NULL); 8];
                    for (octant, result) in collected.into_iter().enumerate() {
                        results[octant] = result?;
                    }
                    results
                } else {
                    let mut results = [(NodePointer::NULL, ColorPointer::NULL); 8];
                    for octant in 0..8u32 {
                        results[octant as usize] = self.vbr_node_rec(
                            editor,
                            colors,
                            coord.child(octant),
                            children[octant as usize],
                            color_children[octant as usize],
                        )?;
                    }
                    results
                };

                let mut geometry_children = [NodePointer::NULL; 8];
                let mut new_color_children = [ColorPointer::NULL; 8];
                for octant in 0..8 {
                    geometry_children[octant] = results[octant].0;
                    new_color_children[octant] = results[octant].1;
                }

                let geometry = self.upsert_children(coord.level, &geometry_children)?;
                let color = if geometry.is_null() {
                    ColorPointer::NULL
                } else if color_ptr.tag() == ColorTag::Node && new_color_children == color_children {
                    // nothing below changed; keep the stored node
                    color_ptr
                } else {
                    match colors.make_node(&new_color_children) {
                        Ok(color) => color,
                        Err(DagError::OutOfPages) => {
                            log::warn!(
                                "color pool out of pages at level {}, keeping pre-edit colors",
                                coord.level
                            );
                            color_ptr
                        }
                        Err(err) => return Err(err),
                    }
                };
                Ok((geometry, color))
            }
        }
    }

    /// Rewrites the VBR chunk of one color leaf while editing the geometry
    /// subtree below it. The fused walk appends one color per voxel of the
    /// cube in Morton order, which is exactly the order the recursion visits
    /// octants in.
    fn vbr_chunk_rewrite<E: VBREditor>(
        &self,
        editor: &E,
        colors: &ColorPool,
        coord: NodeCoord,
        ptr: NodePointer,
        color_ptr: ColorPointer,
    ) -> Result<(NodePointer, ColorPointer), DagError> {
        let chunk_len = colors.chunk_len(self.config());
        let old_chunk;
        let mut source = match color_ptr.tag() {
            ColorTag::Leaf => {
                old_chunk = colors.read_chunk(color_ptr, chunk_len);
                ColorSource::Chunk(old_chunk.reader().cursor())
            }
            ColorTag::Solid => ColorSource::Constant(color_ptr.solid_color().unwrap_or_default()),
            ColorTag::Null => ColorSource::Constant(RGB8Color::default()),
            ColorTag::Node => unreachable!("color node at leaf level"),
        };

        let mut writer = VBRChunkWriter::new();
        let geometry = self.vbr_below_rec(editor, coord, ptr, &mut source, &mut writer)?;
        debug_assert_eq!(writer.len(), chunk_len);

        if geometry.is_null() {
            return Ok((geometry, ColorPointer::NULL));
        }

        let color = if let Some(uniform) = writer.uniform_color() {
            ColorPointer::solid(uniform)
        } else {
            let prev = if color_ptr.tag() == ColorTag::Leaf {
                color_ptr
            } else {
                ColorPointer::NULL
            };
            match colors.set_leaf(prev, &writer.finish()) {
                Ok(leaf) => leaf,
                Err(DagError::OutOfPages) => {
                    log::warn!("color pool out of pages, keeping pre-edit leaf");
                    color_ptr
                }
                Err(err) => return Err(err),
            }
        };
        Ok((geometry, color))
    }

    /// The fused descent below the color leaf level: sequential within one
    /// chunk, since the writer is a strictly ordered stream.
    fn vbr_below_rec<E: VBREditor>(
        &self,
        editor: &E,
        coord: NodeCoord,
        ptr: NodePointer,
        source: &mut ColorSource<'_>,
        writer: &mut VBRChunkWriter,
    ) -> Result<NodePointer, DagError> {
        let config = self.config();
        let cube_len = 1u64 << (3 * (config.voxel_level() - coord.level));
        let mut fill: Option<VBRColor> = None;
        match editor.edit_node_color(config, coord, ptr, &mut fill) {
            EditDecision::Unaffected => {
                match fill {
                    Some(fill) if !ptr.is_null() => {
                        writer.append_run(fill.decode(), cube_len);
                        source.skip(cube_len);
                    }
                    _ => source.copy_to(writer, cube_len),
                }
                Ok(ptr)
            }
            // cleared voxels keep their stale colors; the geometry alone
            // decides visibility
            EditDecision::Clear => {
                source.copy_to(writer, cube_len);
                Ok(NodePointer::NULL)
            }
            EditDecision::Fill => {
                match fill {
                    Some(fill) => {
                        writer.append_run(fill.decode(), cube_len);
                        source.skip(cube_len);
                    }
                    None => source.copy_to(writer, cube_len),
                }
                Ok(NodePointer::FILLED)
            }
            EditDecision::Proceed if coord.level == config.leaf_level() => {
                let old = self.leaf_bits(ptr);
                let mut bits = 0u64;
                for upper in 0..8u32 {
                    for lower in 0..8u32 {
                        let index = upper * 8 + lower;
                        let voxel_coord = leaf_voxel_coord(config, coord, upper, lower);
                        let mut color = VBRColor::solid(source.next());
                        if editor.edit_voxel_color(config, voxel_coord, old >> index & 1 != 0, &mut color) {
                            bits |= 1 << index;
                        }
                        writer.append(color);
                    }
                }
                self.upsert_leaf(bits)
            }
            EditDecision::Proceed => {
                let children = self.children_of(ptr);
                let mut results = [NodePointer::NULL; 8];
                for octant in 0..8u32 {
                    results[octant as usize] = self.vbr_below_rec(
                        editor,
                        coord.child(octant),
                        children[octant as usize],
                        source,
                        writer,
                    )?;
                }
                self.upsert_children(coord.level, &results)
            }
        }
    }
}

/// Voxel-level coordinate of one bit of a 4x4x4 leaf.
#[inline]
fn leaf_voxel_coord(config: &NodeConfig, leaf: NodeCoord, upper: u32, lower: u32) -> NodeCoord {
    NodeCoord::voxel(
        config.voxel_level(),
        Vector3::new(
            leaf.pos.x * 4 + (upper & 1) * 2 + (lower & 1),
            leaf.pos.y * 4 + ((upper >> 1) & 1) * 2 + ((lower >> 1) & 1),
            leaf.pos.z * 4 + ((upper >> 2) & 1) * 2 + ((lower >> 2) & 1),
        ),
    )
}

#[cfg(test)]
mod edit_tests {
    use super::*;
    use crate::dag::tests::{small_config, test_threads};

    /// Sets or clears a single voxel; descends everywhere its voxel lives.
    struct PointEditor {
        pos: Vector3<u32>,
        set: bool,
    }

    impl Editor for PointEditor {
        fn edit_node(&self, config: &NodeConfig, coord: NodeCoord, _ptr: NodePointer) -> EditDecision {
            let lb = coord.lower_bound_at(config.voxel_level());
            let ub = coord.upper_bound_at(config.voxel_level());
            let inside = self.pos.x >= lb.x
                && self.pos.x < ub.x
                && self.pos.y >= lb.y
                && self.pos.y < ub.y
                && self.pos.z >= lb.z
                && self.pos.z < ub.z;
            if inside {
                EditDecision::Proceed
            } else {
                EditDecision::Unaffected
            }
        }

        fn edit_voxel(&self, _config: &NodeConfig, coord: NodeCoord, voxel: bool) -> bool {
            if coord.pos == self.pos {
                self.set
            } else {
                voxel
            }
        }
    }

    #[test]
    fn single_voxel_roundtrip() {
        let pool = NodePool::new(small_config()).unwrap();
        let threads = test_threads();
        let pos = Vector3::new(5, 11, 2);

        let root = pool
            .edit(&threads, NodePointer::NULL, &PointEditor { pos, set: true })
            .unwrap();
        assert!(root.addr().is_some());
        assert!(pool.get_voxel(root, pos));
        assert!(!pool.get_voxel(root, Vector3::new(5, 11, 3)));
        assert!(!pool.get_voxel(root, Vector3::new(0, 0, 0)));

        // clearing the voxel again collapses the world to Null
        let cleared = pool.edit(&threads, root, &PointEditor { pos, set: false }).unwrap();
        assert_eq!(cleared, NodePointer::NULL);
    }

    #[test]
    fn unaffected_returns_identical_pointer() {
        let pool = NodePool::new(small_config()).unwrap();
        let threads = test_threads();
        let pos = Vector3::new(9, 1, 15);

        let root = pool
            .edit(&threads, NodePointer::NULL, &PointEditor { pos, set: true })
            .unwrap();
        // setting an already-set voxel rewrites every node into itself
        let again = pool.edit(&threads, root, &PointEditor { pos, set: true }).unwrap();
        assert_eq!(root, again);
    }
}
