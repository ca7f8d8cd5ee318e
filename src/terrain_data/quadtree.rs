use crate::{
    config::StreamingConfig,
    math::{TileAddress, ViewCamera},
    terrain_data::{
        mesh::MeshData,
        tile_cache::{CacheError, TileCache},
        tile_loader::{PyramidReader, TerrainGeometry, TileContent, TileLoader},
        NodeHandle, Side, Sides,
    },
};
use anyhow::{anyhow, Result};
use bevy::{
    log::{debug, info, warn},
    math::{DVec3, Vec3},
    prelude::Component,
    tasks::{futures_lite::future, Task, TaskPool, TaskPoolBuilder},
};
use slab::Slab;
use std::{
    collections::HashMap,
    mem,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// The value stored in the tile cache for every loaded node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CachedNode {
    pub tree: usize,
    pub handle: NodeHandle,
}

/// State shared by all terrains of an application: the configuration, the worker pool
/// loading tiles in the background and the tile cache.
pub struct TerrainContext {
    config: StreamingConfig,
    task_pool: TaskPool,
    cache: TileCache<CachedNode>,
    /// Nodes evicted on behalf of another tree, removed by their owner on its next update.
    evicted: Mutex<HashMap<usize, Vec<NodeHandle>>>,
    next_tree: AtomicUsize,
}

impl TerrainContext {
    pub fn new(config: StreamingConfig) -> Self {
        let task_pool = TaskPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name("Terrain Tile Loader".to_string())
            .build();
        let cache = TileCache::new(config.cache_bytes, config.max_cleanup_count);

        Self {
            config,
            task_pool,
            cache,
            evicted: Mutex::new(HashMap::new()),
            next_tree: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn cache(&self) -> &TileCache<CachedNode> {
        &self.cache
    }

    fn register_tree(&self) -> usize {
        self.next_tree.fetch_add(1, Ordering::Relaxed)
    }

    fn evicted_nodes(&self) -> MutexGuard<'_, HashMap<usize, Vec<NodeHandle>>> {
        self.evicted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caches the node of `tree` and returns the node of the same tree that was evicted for it.
    /// Nodes of other trees are handed to their owner instead.
    fn insert(
        &self,
        tree: usize,
        key: String,
        handle: NodeHandle,
        size: usize,
    ) -> Result<Option<NodeHandle>, CacheError> {
        let evicted = self.cache.put(key, CachedNode { tree, handle }, size)?;

        Ok(evicted.and_then(|node| {
            if node.tree == tree {
                Some(node.handle)
            } else {
                self.evicted_nodes()
                    .entry(node.tree)
                    .or_default()
                    .push(node.handle);
                None
            }
        }))
    }

    fn take_evicted(&self, tree: usize) -> Vec<NodeHandle> {
        self.evicted_nodes().remove(&tree).unwrap_or_default()
    }
}

impl Default for TerrainContext {
    fn default() -> Self {
        Self::new(StreamingConfig::default())
    }
}

/// A node of the quadtree, covering one tile of the pyramid.
pub struct QuadNode {
    pub(super) address: TileAddress,
    pub(super) children: Option<[NodeHandle; 4]>,
    /// Same or coarser neighbors, indexed by [`Side::index`].
    pub(super) neighbors: [Option<NodeHandle>; 4],
    /// Sides that have to be stitched before the node is displayed.
    pub(super) dirty: Sides,
    pub(super) in_use: bool,
    pub(super) content: Option<TileContent>,
    center: DVec3,
    /// Lower left, lower right, upper right and upper left corner.
    corners: [DVec3; 4],
}

impl QuadNode {
    fn new(address: TileAddress, geometry: &TerrainGeometry) -> Self {
        let extent = geometry.extent();
        let center = address.center(extent.x, extent.y);
        let half = geometry.node_size(address.level()) / 2.0;

        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)]
            .map(|(x, y)| DVec3::new(center.x + x * half.x, center.y + y * half.y, 0.0));

        Self {
            address,
            children: None,
            neighbors: [None; 4],
            dirty: Sides::empty(),
            in_use: false,
            content: None,
            center: center.extend(0.0),
            corners,
        }
    }

    fn set_content(&mut self, content: TileContent) {
        let mesh = &content.mesh;
        let (width, length) = (mesh.tile_width() as usize, mesh.tile_length() as usize);
        let posts = [(0, length), (width, length), (width, 0), (0, 0)];

        for (corner, (column, row)) in self.corners.iter_mut().zip(posts) {
            corner.z = mesh.elevation(column, row) as f64;
        }
        self.center.z = mesh.elevation(width / 2, length / 2) as f64;

        self.content = Some(content);
    }

    pub fn address(&self) -> &TileAddress {
        &self.address
    }

    pub fn children(&self) -> Option<[NodeHandle; 4]> {
        self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    /// Whether the node is part of the current tree.
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn content(&self) -> Option<&TileContent> {
        self.content.as_ref()
    }

    pub fn mesh(&self) -> Option<&MeshData> {
        self.content.as_ref().map(|content| &content.mesh)
    }

    pub fn neighbor(&self, side: Side) -> Option<NodeHandle> {
        self.neighbors[side.index()]
    }

    pub fn dirty_sides(&self) -> Sides {
        self.dirty
    }

    pub fn center(&self) -> DVec3 {
        self.center
    }

    pub fn corners(&self) -> [DVec3; 4] {
        self.corners
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (lower, upper) = (self.corners[0], self.corners[2]);
        (lower.x..=upper.x).contains(&x) && (lower.y..=upper.y).contains(&y)
    }

    fn radius(&self) -> f64 {
        self.corners
            .iter()
            .map(|corner| corner.distance(self.center))
            .fold(0.0, f64::max)
    }
}

fn sides_with_neighbors(neighbors: &[Option<NodeHandle>; 4]) -> Sides {
    Side::ALL
        .into_iter()
        .filter(|side| neighbors[side.index()].is_some())
        .fold(Sides::empty(), |sides, side| sides | side.flag())
}

struct LoadingTile {
    handle: NodeHandle,
    task: Task<Result<TileContent>>,
}

/// Streams one terrain from its tile pyramids into a view dependent quadtree.
///
/// The root is loaded when the engine is created and stays in the tree for its whole
/// lifetime. Every call to [`update`](Self::update) refines or coarsens the tree for the
/// current camera and stitches the leaves that changed.
#[derive(Component)]
pub struct QuadTreeEngine {
    context: Arc<TerrainContext>,
    loader: Arc<TileLoader>,
    tree: usize,
    pub(super) nodes: Slab<QuadNode>,
    root: NodeHandle,
    loading: Vec<LoadingTile>,
}

impl QuadTreeEngine {
    /// Opens the elevation pyramid in `elevation` and drapes the texture pyramids in `layers`
    /// over it.
    pub fn new<P: AsRef<Path>>(
        context: Arc<TerrainContext>,
        elevation: P,
        layers: impl IntoIterator<Item = P>,
    ) -> Result<Self> {
        let config = context.config();
        let layers = layers
            .into_iter()
            .map(PyramidReader::open)
            .collect::<Result<Vec<_>>>()?;

        let loader = TileLoader::new(
            PyramidReader::open(elevation)?,
            layers,
            config.pixel_scale(),
            config.surface_color,
            config.missing_color,
        )?;

        let tree = context.register_tree();

        let mut engine = Self {
            context,
            loader: Arc::new(loader),
            tree,
            nodes: Slab::new(),
            root: NodeHandle(0),
            loading: Vec::new(),
        };

        engine.root = engine
            .request(&TileAddress::root(), true)?
            .ok_or_else(|| anyhow!("The tile cache is too small to hold the root of the terrain."))?;
        engine.set_in_use(engine.root, true);

        let geometry = engine.geometry();
        info!(
            "Opened terrain {tree} with {} levels of {}x{} tiles covering {} world units.",
            geometry.number_of_levels,
            geometry.tile_width,
            geometry.tile_length,
            geometry.extent()
        );

        Ok(engine)
    }

    pub fn tree_id(&self) -> usize {
        self.tree
    }

    pub fn context(&self) -> &Arc<TerrainContext> {
        &self.context
    }

    pub fn geometry(&self) -> &TerrainGeometry {
        self.loader.geometry()
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn node(&self, handle: NodeHandle) -> Option<&QuadNode> {
        self.nodes.get(handle.0)
    }

    /// Number of nodes held by the engine, including loaded nodes outside of the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    /// The node of the current tree at `address`.
    pub fn find(&self, address: &TileAddress) -> Option<NodeHandle> {
        let mut handle = self.root;
        self.nodes.get(handle.0)?;

        for quadrant in address.quadrants() {
            handle = self.nodes[handle.0].children?[quadrant.index()];
        }

        Some(handle)
    }

    /// The leaves of the current tree, from west to east and north to south within each parent.
    pub fn leaves(&self) -> Vec<(NodeHandle, TileAddress)> {
        self.leaf_handles()
            .into_iter()
            .map(|handle| (handle, self.nodes[handle.0].address.clone()))
            .collect()
    }

    pub(super) fn leaf_handles(&self) -> Vec<NodeHandle> {
        let mut leaves = Vec::new();

        if !self.nodes.contains(self.root.0) {
            return leaves;
        }

        let mut stack = vec![self.root];

        while let Some(handle) = stack.pop() {
            match self.nodes[handle.0].children {
                Some(children) => stack.extend(children.into_iter().rev()),
                None => leaves.push(handle),
            }
        }

        leaves
    }

    /// Whether any leaf still waits to be stitched.
    pub fn is_dirty(&self) -> bool {
        self.leaf_handles()
            .iter()
            .any(|handle| !self.nodes[handle.0].dirty.is_empty())
    }

    /// Refines the tree for the camera and stitches the changed leaves.
    /// Returns whether the tree changed.
    pub fn update(&mut self, camera: &impl ViewCamera) -> Result<bool> {
        if !self.nodes.contains(self.root.0) {
            return Ok(false);
        }

        self.remove_evicted();
        let loaded = self.poll_loading();

        let changed = self.update_node(self.root, camera)?;

        if changed || loaded > 0 {
            self.stitch();
        }

        Ok(changed)
    }

    /// Waits for all tiles that are currently loaded in the background.
    pub fn block_until_loaded(&mut self) {
        for tile in mem::take(&mut self.loading) {
            let result = future::block_on(tile.task);
            self.finish_loading(tile.handle, result);
        }
    }

    /// Bilinearly interpolated elevation of the current leaf at `x` and `y`.
    /// Returns [`None`] outside of the terrain and above leaves without elevation data.
    pub fn elevation_at(&self, x: f64, y: f64) -> Option<f32> {
        let (node, mesh) = self.leaf_mesh_at(x, y)?;
        let lower_left = node.corners[0];
        Some(mesh.elevation_bilinear(x - lower_left.x, y - lower_left.y))
    }

    /// Elevation of the post of the current leaf closest to `x` and `y`.
    pub fn elevation_nearest_at(&self, x: f64, y: f64) -> Option<f32> {
        let (node, mesh) = self.leaf_mesh_at(x, y)?;
        let lower_left = node.corners[0];
        Some(mesh.elevation_nearest(x - lower_left.x, y - lower_left.y))
    }

    pub fn normal_at(&self, x: f64, y: f64) -> Option<Vec3> {
        let (node, mesh) = self.leaf_mesh_at(x, y)?;
        let lower_left = node.corners[0];
        Some(mesh.normal_bilinear(x - lower_left.x, y - lower_left.y))
    }

    fn leaf_mesh_at(&self, x: f64, y: f64) -> Option<(&QuadNode, &MeshData)> {
        let mut node = self.nodes.get(self.root.0).filter(|node| node.contains(x, y))?;

        while let Some(children) = node.children {
            node = children
                .iter()
                .map(|child| &self.nodes[child.0])
                .find(|child| child.contains(x, y))?;
        }

        let mesh = node.mesh().filter(|mesh| !mesh.is_empty())?;
        Some((node, mesh))
    }

    /// Recolors the surface of every loaded node.
    pub fn set_surface_color(&mut self, color: [f32; 4]) {
        for (_, node) in &mut self.nodes {
            if let Some(content) = &mut node.content {
                content.mesh.set_surface_color(color);
            }
        }
    }

    /// Cancels all loads and removes every node of this terrain from the cache.
    /// The engine is empty afterwards.
    pub fn teardown(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        self.loading.clear();
        self.context.cache.evict_by_prefix(&self.key_prefix());
        self.context.take_evicted(self.tree);

        let count = self.nodes.len();
        self.nodes.clear();

        info!("Released {count} nodes of terrain {}.", self.tree);
    }

    fn key_prefix(&self) -> String {
        format!("{}:", self.tree)
    }

    fn key(&self, address: &TileAddress) -> String {
        format!("{}:{address}", self.tree)
    }

    fn set_in_use(&mut self, handle: NodeHandle, in_use: bool) {
        self.nodes[handle.0].in_use = in_use;

        let key = self.key(&self.nodes[handle.0].address);
        self.context.cache.set_in_use(&key, in_use);
    }

    /// Returns the node at `address` once it is loaded.
    ///
    /// Nodes that are not cached yet are created and loaded, either right away if `wait` is
    /// set, or in the background.
    fn request(
        &mut self,
        address: &TileAddress,
        wait: bool,
    ) -> Result<Option<NodeHandle>, CacheError> {
        self.remove_evicted();

        let key = self.key(address);
        let cached = self
            .context
            .cache
            .get(&key)
            .map(|node| node.handle)
            .filter(|handle| {
                self.nodes
                    .get(handle.0)
                    .is_some_and(|node| &node.address == address)
            });

        let handle = match cached {
            Some(handle) => handle,
            None => {
                let node = QuadNode::new(address.clone(), self.loader.geometry());
                let handle = NodeHandle(self.nodes.insert(node));
                let size = self.loader.node_bytes();

                if let Some(evicted) = self.context.insert(self.tree, key, handle, size)? {
                    self.remove_node(evicted);

                    if evicted == handle {
                        warn!(
                            "The node {address} of terrain {} was evicted right after it was requested.",
                            self.tree
                        );
                        return Ok(None);
                    }
                }

                handle
            }
        };

        if !self.nodes[handle.0].is_loaded() {
            if wait {
                self.load_now(handle);
            } else if !self.loading.iter().any(|tile| tile.handle == handle) {
                self.start_loading(handle);
            }
        }

        Ok(self.nodes[handle.0].is_loaded().then_some(handle))
    }

    fn start_loading(&mut self, handle: NodeHandle) {
        let address = self.nodes[handle.0].address.clone();
        let loader = self.loader.clone();

        let task = self
            .context
            .task_pool
            .spawn(async move { loader.load(&address) });

        self.loading.push(LoadingTile { handle, task });
    }

    fn load_now(&mut self, handle: NodeHandle) {
        let result = match self.loading.iter().position(|tile| tile.handle == handle) {
            Some(index) => future::block_on(self.loading.swap_remove(index).task),
            None => self.loader.load(&self.nodes[handle.0].address),
        };

        self.finish_loading(handle, result);
    }

    fn poll_loading(&mut self) -> usize {
        let mut finished = Vec::new();

        self.loading.retain_mut(|tile| {
            match future::block_on(future::poll_once(&mut tile.task)) {
                Some(result) => {
                    finished.push((tile.handle, result));
                    false
                }
                None => true,
            }
        });

        let count = finished.len();
        for (handle, result) in finished {
            self.finish_loading(handle, result);
        }

        count
    }

    fn finish_loading(&mut self, handle: NodeHandle, result: Result<TileContent>) {
        let Some(node) = self.nodes.get_mut(handle.0) else {
            return;
        };

        let content = result.unwrap_or_else(|error| {
            warn!(
                "Failed to load the node {} of terrain {}: {error:#}",
                node.address, self.tree
            );
            self.loader.no_data(&node.address)
        });

        node.set_content(content);
    }

    fn remove_evicted(&mut self) {
        for handle in self.context.take_evicted(self.tree) {
            self.remove_node(handle);
        }
    }

    /// Drops an evicted node together with its pending load.
    fn remove_node(&mut self, handle: NodeHandle) {
        self.loading.retain(|tile| tile.handle != handle);

        if let Some(node) = self.nodes.try_remove(handle.0) {
            debug!("Evicted the node {} of terrain {}.", node.address, self.tree);
        }
    }

    fn update_node(&mut self, handle: NodeHandle, camera: &impl ViewCamera) -> Result<bool> {
        let node = &self.nodes[handle.0];

        if !node.in_use {
            return Ok(false);
        }

        let culled = camera.is_culled(node.center, node.radius());

        let location = camera.location();
        let look_at = camera.look_at();

        let mut distance = f64::MAX;
        if node.contains(look_at.x, look_at.y) {
            distance = location.distance(look_at);
        }
        for point in node.corners.iter().chain([&node.center]) {
            distance = distance.min(location.distance(*point));
        }

        let Some(pixel_size) = camera.pixel_size_at(distance) else {
            return Ok(false);
        };
        let pixel_size = pixel_size * self.context.config.min_pixels_per_cell;
        let pixel_width = self.geometry().pixel_size(node.address.level()).x;
        let children = node.children;

        if pixel_size >= pixel_width || culled {
            Ok(children.is_some() && self.merge(handle))
        } else if pixel_size <= pixel_width / 2.0 {
            match children {
                None => Ok(self.split(handle)?),
                Some(children) => self.update_children(children, camera),
            }
        } else if let Some(children) = children {
            self.update_children(children, camera)
        } else {
            Ok(false)
        }
    }

    fn update_children(
        &mut self,
        children: [NodeHandle; 4],
        camera: &impl ViewCamera,
    ) -> Result<bool> {
        let mut changed = false;

        for child in children {
            changed |= self.update_node(child, camera)?;
        }

        Ok(changed)
    }

    /// Replaces the leaf by its four children, as soon as all of them are loaded.
    pub(super) fn split(&mut self, handle: NodeHandle) -> Result<bool, CacheError> {
        let address = self.nodes[handle.0].address.clone();

        if !self.geometry().has_children(address.level()) {
            return Ok(false);
        }

        let wait = !self.context.config.async_loading;
        let addresses = address.children();

        let mut requested = [None; 4];
        for (slot, child) in requested.iter_mut().zip(&addresses) {
            *slot = self.request(child, wait)?;
        }

        // a later request may have evicted an earlier child
        let mut ready = [None; 4];
        for ((slot, child), expected) in ready.iter_mut().zip(requested).zip(&addresses) {
            *slot = child.filter(|child: &NodeHandle| {
                self.nodes
                    .get(child.0)
                    .is_some_and(|node| node.is_loaded() && &node.address == expected)
            });
        }

        let [Some(c0), Some(c1), Some(c2), Some(c3)] = ready else {
            return Ok(false);
        };

        self.set_children(handle, [c0, c1, c2, c3]);
        debug!("Split the node {address} of terrain {}.", self.tree);

        Ok(true)
    }

    fn set_children(&mut self, handle: NodeHandle, children: [NodeHandle; 4]) {
        let [c0, c1, c2, c3] = children;
        let [left, right, bottom, top] = self.nodes[handle.0].neighbors;

        let neighbors = [
            [left, Some(c1), Some(c2), top],
            [Some(c0), right, Some(c3), top],
            [left, Some(c3), bottom, Some(c0)],
            [Some(c2), right, bottom, Some(c1)],
        ];

        for (child, neighbors) in children.into_iter().zip(neighbors) {
            let node = &mut self.nodes[child.0];
            node.neighbors = neighbors;
            node.dirty = sides_with_neighbors(&neighbors);

            self.set_in_use(child, true);
        }

        let node = &mut self.nodes[handle.0];
        node.children = Some(children);
        node.dirty = Sides::empty();
    }

    /// Replaces the children of the node by its own mesh again.
    pub(super) fn merge(&mut self, handle: NodeHandle) -> bool {
        let merged = self.clear_children(handle);

        if merged {
            debug!(
                "Merged the node {} of terrain {}.",
                self.nodes[handle.0].address, self.tree
            );
        }

        merged
    }

    fn clear_children(&mut self, handle: NodeHandle) -> bool {
        let Some(children) = self.nodes[handle.0].children.take() else {
            return false;
        };

        for child in children {
            self.clear_children(child);

            let node = &mut self.nodes[child.0];
            node.neighbors = [None; 4];
            node.dirty = Sides::empty();

            self.set_in_use(child, false);
        }

        let node = &mut self.nodes[handle.0];
        node.dirty = sides_with_neighbors(&node.neighbors);

        true
    }
}

impl Drop for QuadTreeEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
