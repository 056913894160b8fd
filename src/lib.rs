//! A hash-consed sparse voxel octree DAG.
//!
//! The world is a binary occupancy octree of up to `2^17` voxels per axis,
//! stored in an append-only, content-deduplicated node pool ([`NodePool`]),
//! paired with a second octree of compressed per-voxel colors
//! ([`ColorPool`]). Structurally identical subtrees share one allocation, so
//! large uniform worlds collapse into a handful of nodes.
//!
//! Edits are expressed as [`Editor`] implementations that classify every
//! subtree they visit (keep / clear / fill / descend) and are applied by a
//! parallel recursive rewrite that returns a new root pointer. Both pools sit
//! on lazily materialized paged stores whose dirty-page diffs are flushed to
//! a [`PageBackend`].

pub mod dag;
pub mod systems;

pub use dag::config::{ColorConfig, NodeConfig};
pub use dag::coord::NodeCoord;
pub use dag::edit::{EditDecision, Editor, VBREditor};
pub use dag::editors::{AabbEditor, SphereEditor, SphereMode};
pub use dag::gc::collect_garbage;
pub use dag::paged::{MemoryBackend, PageBackend, PageOp, PagedStore, PagedVec};
pub use dag::pointer::{ColorPointer, ColorTag, NodePointer};
pub use dag::vbr::{RGB8Color, VBRChunk, VBRChunkReader, VBRChunkWriter, VBRColor};
pub use dag::DagError;
pub use dag::{ColorPool, NodePool};
pub use systems::edits::{EditQueue, Ticket};
