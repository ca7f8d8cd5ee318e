//! Closing the cracks between neighboring leaves.
//!
//! Every boundary vertex of a leaf is a post on the vertex grid of the finest level.
//! Leaves are stitched from coarse to fine, and the first leaf to reach a post decides its
//! elevation and normal for every other leaf sharing it. Posts that lie between the vertices of
//! a coarser neighbor's edge are interpolated linearly from the current edge of that neighbor.
//!
//! Neighbor references always point to nodes of the same or a coarser level,
//! so the leaves touching a side are found by descending into the neighbor.

use crate::{
    math::TileAddress,
    terrain_data::{
        mesh::{EdgePost, MeshData},
        quadtree::QuadTreeEngine,
        NodeHandle, Side, Sides,
    },
};
use bevy::math::Vec3;
use std::collections::{hash_map::Entry, HashMap};

/// Column and row of a post on the vertex grid of the finest level.
type PostKey = (u64, u64);

/// Places the vertices of one leaf on the vertex grid of the finest level.
#[derive(Copy, Clone, Debug)]
struct PostGrid {
    origin: PostKey,
    spacing: u64,
}

impl PostGrid {
    fn key(&self, mesh: &MeshData, side: Side, index: usize) -> PostKey {
        let (column, row) = mesh.edge_vertex(side, index);

        (
            self.origin.0 + column as u64 * self.spacing,
            self.origin.1 + row as u64 * self.spacing,
        )
    }
}

/// The unstitched post of the coarsest leaves sharing it.
struct OriginalPost {
    level: u32,
    elevation: f32,
    normal: Vec3,
}

impl OriginalPost {
    fn post(&self) -> EdgePost {
        EdgePost {
            elevation: self.elevation,
            normal: self.normal.normalize_or(Vec3::Z),
        }
    }
}

/// Every boundary vertex of a grid, each corner once.
fn boundary_posts(columns: usize, rows: usize) -> impl Iterator<Item = (Side, usize)> {
    (0..columns)
        .flat_map(|index| [(Side::Top, index), (Side::Bottom, index)])
        .chain((1..rows - 1).flat_map(|index| [(Side::Left, index), (Side::Right, index)]))
}

impl QuadTreeEngine {
    /// Stitches the edges of all current leaves and clears their dirty sides.
    ///
    /// The stitch starts from the original edges on every call,
    /// so the result only depends on the shape of the tree.
    pub(super) fn stitch(&mut self) {
        let mut leaves = self.leaf_handles();
        leaves.retain(|&leaf| !self.has_empty_mesh(leaf));
        leaves.sort_by_key(|leaf| self.nodes[leaf.0].address.level());

        let originals = self.original_posts(&leaves);
        let mut resolved = HashMap::new();

        for leaf in leaves {
            self.stitch_leaf(leaf, &originals, &mut resolved);
        }

        for leaf in self.leaf_handles() {
            self.nodes[leaf.0].dirty = Sides::empty();
        }
    }

    fn has_empty_mesh(&self, handle: NodeHandle) -> bool {
        self.nodes[handle.0]
            .mesh()
            .map_or(true, |mesh| mesh.is_empty())
    }

    fn post_grid(&self, handle: NodeHandle) -> PostGrid {
        let geometry = self.geometry();
        let address = &self.nodes[handle.0].address;

        let spacing = 1 << geometry.number_of_levels.saturating_sub(address.level() + 1);
        let (column, row) = address.grid_position();

        PostGrid {
            origin: (
                column * geometry.tile_width as u64 * spacing,
                row * geometry.tile_length as u64 * spacing,
            ),
            spacing,
        }
    }

    /// The cached edges of the coarsest leaves at every post, with the normals of leaves of
    /// the same level averaged.
    fn original_posts(&self, leaves: &[NodeHandle]) -> HashMap<PostKey, OriginalPost> {
        let mut originals = HashMap::new();

        for &leaf in leaves {
            let node = &self.nodes[leaf.0];
            let Some(mesh) = node.mesh() else {
                continue;
            };

            let level = node.address.level();
            let grid = self.post_grid(leaf);

            for (side, index) in boundary_posts(mesh.columns(), mesh.rows()) {
                let Some(post) = mesh.edges().post(side, index) else {
                    continue;
                };

                let original = OriginalPost {
                    level,
                    elevation: post.elevation,
                    normal: post.normal,
                };

                match originals.entry(grid.key(mesh, side, index)) {
                    Entry::Vacant(entry) => {
                        entry.insert(original);
                    }
                    Entry::Occupied(mut entry) => {
                        let shared = entry.get_mut();

                        if level < shared.level {
                            *shared = original;
                        } else if level == shared.level {
                            shared.normal += original.normal;
                        }
                    }
                }
            }
        }

        originals
    }

    fn stitch_leaf(
        &mut self,
        leaf: NodeHandle,
        originals: &HashMap<PostKey, OriginalPost>,
        resolved: &mut HashMap<PostKey, EdgePost>,
    ) {
        let fills = self.coarser_posts(leaf);
        let grid = self.post_grid(leaf);

        let Some(mesh) = self.nodes[leaf.0].mesh() else {
            return;
        };

        let mut edges: [Vec<EdgePost>; 4] = Default::default();

        for side in Side::ALL {
            for index in 0..mesh.edge_length(side) {
                let key = grid.key(mesh, side, index);

                let post = *resolved.entry(key).or_insert_with(|| {
                    fills
                        .get(&key)
                        .copied()
                        .or_else(|| originals.get(&key).map(OriginalPost::post))
                        .unwrap_or_else(|| mesh.edge_post(side, index))
                });

                edges[side.index()].push(post);
            }
        }

        if let Some(content) = self.nodes[leaf.0].content.as_mut() {
            for side in Side::ALL {
                content.mesh.set_edge_posts(side, &edges[side.index()]);
            }
        }
    }

    /// The posts of the leaf on the edges of coarser leaves,
    /// interpolated from the current edges of those leaves.
    fn coarser_posts(&self, leaf: NodeHandle) -> HashMap<PostKey, EdgePost> {
        let mut posts = HashMap::new();

        let node = &self.nodes[leaf.0];
        let Some(mesh) = node.mesh() else {
            return posts;
        };

        let level = node.address.level();
        let grid = self.post_grid(leaf);

        for side in Side::ALL {
            let Some(neighbor) = node.neighbors[side.index()] else {
                continue;
            };

            let mut touching = Vec::new();
            self.touching_leaves(side, neighbor, &node.address, &mut touching);

            // a coarser leaf covers the whole side
            let Some(coarse) = touching.into_iter().find(|&other| {
                self.nodes[other.0].address.level() < level && !self.has_empty_mesh(other)
            }) else {
                continue;
            };
            let Some(coarse_mesh) = self.nodes[coarse.0].mesh() else {
                continue;
            };

            let facing = side.opposite();
            let coarse_grid = self.post_grid(coarse);
            let start = coarse_grid.key(coarse_mesh, facing, 0);

            for index in 0..mesh.edge_length(side) {
                let key = grid.key(mesh, side, index);
                let offset = if side.is_column() {
                    key.1.saturating_sub(start.1)
                } else {
                    key.0.saturating_sub(start.0)
                };

                posts.insert(
                    key,
                    coarse_mesh.edge_post_at(facing, offset, coarse_grid.spacing),
                );
            }
        }

        posts
    }

    /// Collects the leaves below `neighbor` that touch the node at `address` on `side`.
    fn touching_leaves(
        &self,
        side: Side,
        neighbor: NodeHandle,
        address: &TileAddress,
        leaves: &mut Vec<NodeHandle>,
    ) {
        let node = &self.nodes[neighbor.0];

        let Some(children) = node.children else {
            leaves.push(neighbor);
            return;
        };

        let level = node.address.level();

        if level >= address.level() {
            // the children of the neighbor along the shared edge
            let facing = match side {
                Side::Left => [1, 3],
                Side::Right => [0, 2],
                Side::Bottom => [0, 1],
                Side::Top => [2, 3],
            };

            for index in facing {
                self.touching_leaves(side, children[index], address, leaves);
            }
        } else if let Some(quadrant) = address.quadrant_at(level) {
            let mirrored = if side.is_column() {
                quadrant.mirror_horizontal()
            } else {
                quadrant.mirror_vertical()
            };

            self.touching_leaves(side, children[mirrored.index()], address, leaves);
        }
    }
}
