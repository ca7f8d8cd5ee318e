//! The runtime half of the crate: streaming a tile pyramid into a view dependent quadtree.
//!
//! # Explanation
//! Each [`QuadTreeEngine`](quadtree::QuadTreeEngine) owns the nodes of one terrain in an arena.
//! Every node covers one tile of the pyramid and either owns the [`MeshData`](mesh::MeshData)
//! of that tile (a leaf) or exactly four children (split).
//! Once per frame the engine decides for each visible node whether it should be split into
//! its finer children or merged back into its own coarser mesh, based on the size of a
//! screen pixel at the node's closest point to the camera.
//!
//! Nodes are loaded on demand by background workers and kept in a bounded
//! [`TileCache`](tile_cache::TileCache), which evicts the least recently used nodes that are
//! not part of the current tree. After the tree changed, neighboring leaves of different
//! resolution are stitched together along their shared edges, so that no cracks appear
//! between them.

use bitflags::bitflags;

pub mod mesh;
pub mod quadtree;
pub mod stitch;
pub mod tile_cache;
pub mod tile_loader;

/// A side of a quadtree node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Side {
    Left,
    Right,
    Bottom,
    Top,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::Left, Side::Right, Side::Bottom, Side::Top];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The side of the neighbor that touches this side.
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Bottom => Side::Top,
            Side::Top => Side::Bottom,
        }
    }

    /// Whether the edge of this side runs along a column of the mesh.
    pub fn is_column(self) -> bool {
        matches!(self, Side::Left | Side::Right)
    }

    pub fn flag(self) -> Sides {
        match self {
            Side::Left => Sides::LEFT,
            Side::Right => Sides::RIGHT,
            Side::Bottom => Sides::BOTTOM,
            Side::Top => Sides::TOP,
        }
    }
}

bitflags! {
    /// A set of sides, used to track which edges of a leaf still need stitching.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Sides: u8 {
        const LEFT   = 1 << 0;
        const RIGHT  = 1 << 1;
        const BOTTOM = 1 << 2;
        const TOP    = 1 << 3;
    }
}

/// The key of a node inside the arena of its [`QuadTreeEngine`](quadtree::QuadTreeEngine).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeHandle(pub(crate) usize);
