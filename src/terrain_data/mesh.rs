use crate::terrain_data::Side;
use bevy::{
    math::Vec3,
    render::{
        mesh::{Indices, Mesh, PrimitiveTopology},
        render_asset::RenderAssetUsages,
    },
};
use itertools::iproduct;
use std::mem;

/// Copies of the four boundary rows and columns of a mesh, taken when the mesh is built.
///
/// Stitching overwrites the boundary of the mesh itself, so these copies are used to restore
/// the original samples once a neighbor changes its resolution again.
/// Column edges (left and right) are ordered from top to bottom,
/// row edges (bottom and top) from left to right.
#[derive(Clone, Debug, Default)]
pub struct EdgeCache {
    elevations: [Vec<f32>; 4],
    normals: [Vec<[f32; 3]>; 4],
}

impl EdgeCache {
    pub fn elevations(&self, side: Side) -> &[f32] {
        &self.elevations[side.index()]
    }

    pub fn normals(&self, side: Side) -> &[[f32; 3]] {
        &self.normals[side.index()]
    }

    /// The original elevation and normal of the `index`th vertex along the edge on `side`.
    pub fn post(&self, side: Side, index: usize) -> Option<EdgePost> {
        let elevation = *self.elevations[side.index()].get(index)?;
        let normal = *self.normals[side.index()].get(index)?;

        Some(EdgePost {
            elevation,
            normal: Vec3::from_array(normal),
        })
    }
}

/// Elevation and normal of a vertex on the boundary of a mesh.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EdgePost {
    pub elevation: f32,
    pub normal: Vec3,
}

impl EdgePost {
    /// Interpolates linearly towards `other`. A weight of zero returns this post unchanged.
    pub fn lerp(self, other: EdgePost, weight: f64) -> EdgePost {
        if weight == 0.0 {
            return self;
        }

        let elevation =
            self.elevation as f64 + weight * (other.elevation as f64 - self.elevation as f64);

        EdgePost {
            elevation: elevation as f32,
            normal: self
                .normal
                .lerp(other.normal, weight as f32)
                .normalize_or(Vec3::Z),
        }
    }
}

/// The geometry of a single quadtree leaf.
///
/// The vertices form a regular grid of `tile_width + 1` by `tile_length + 1` posts,
/// stored row by row starting at the top left corner and centered on the origin of the node.
/// Each row of cells is one triangle strip.
#[derive(Clone, Debug)]
pub struct MeshData {
    tile_width: u32,
    tile_length: u32,
    pixel_width: f64,
    pixel_length: f64,
    empty: bool,
    surface_color: [f32; 4],
    positions: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    colors: Vec<[f32; 4]>,
    tex_coords: Vec<[f32; 2]>,
    indices: Vec<u32>,
    strip_length: usize,
    edges: EdgeCache,
}

impl MeshData {
    /// Builds the mesh of a tile with `(tile_width + 1) * (tile_length + 1)` elevation samples.
    ///
    /// Missing samples (`NaN`) are replaced by `fill_value` and colored with `missing_color`.
    /// If no sample is valid, the result is an [`empty`](Self::empty) mesh.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        samples: &[f32],
        tile_width: u32,
        tile_length: u32,
        pixel_width: f64,
        pixel_length: f64,
        fill_value: f32,
        surface_color: [f32; 4],
        missing_color: [f32; 4],
    ) -> Self {
        let (columns, rows) = (tile_width as usize + 1, tile_length as usize + 1);

        if samples.len() < columns * rows || samples.iter().all(|sample| sample.is_nan()) {
            return Self::empty(
                tile_width,
                tile_length,
                pixel_width,
                pixel_length,
                fill_value,
                missing_color,
            );
        }

        let width = pixel_width * tile_width as f64;
        let length = pixel_length * tile_length as f64;

        let mut positions = Vec::with_capacity(columns * rows);
        let mut colors = Vec::with_capacity(columns * rows);
        let mut tex_coords = Vec::with_capacity(columns * rows);

        for (row, column) in iproduct!(0..rows, 0..columns) {
            let sample = samples[row * columns + column];

            let (z, color) = if sample.is_nan() {
                (fill_value, missing_color)
            } else {
                (sample, surface_color)
            };

            positions.push([
                (-width / 2.0 + column as f64 * pixel_width) as f32,
                (length / 2.0 - row as f64 * pixel_length) as f32,
                z,
            ]);
            colors.push(color);
            tex_coords.push([
                column as f32 / tile_width as f32,
                row as f32 / tile_length as f32,
            ]);
        }

        let indices = (0..rows - 1)
            .flat_map(|row| {
                (0..columns).flat_map(move |column| {
                    let index = (row * columns + column) as u32;
                    [index, index + columns as u32]
                })
            })
            .collect();

        let normals = grid_normals(&positions, columns, rows);

        let mut mesh = Self {
            tile_width,
            tile_length,
            pixel_width,
            pixel_length,
            empty: false,
            surface_color,
            positions,
            normals,
            colors,
            tex_coords,
            indices,
            strip_length: columns * 2,
            edges: EdgeCache::default(),
        };

        mesh.cache_edges();
        mesh
    }

    /// A flat quad at the height of `fill_value`, used for tiles without any data.
    pub fn empty(
        tile_width: u32,
        tile_length: u32,
        pixel_width: f64,
        pixel_length: f64,
        fill_value: f32,
        missing_color: [f32; 4],
    ) -> Self {
        let x = (pixel_width * tile_width as f64 / 2.0) as f32;
        let y = (pixel_length * tile_length as f64 / 2.0) as f32;

        Self {
            tile_width,
            tile_length,
            pixel_width,
            pixel_length,
            empty: true,
            surface_color: missing_color,
            // top left, bottom left, bottom right, top right
            positions: vec![
                [-x, y, fill_value],
                [-x, -y, fill_value],
                [x, -y, fill_value],
                [x, y, fill_value],
            ],
            normals: vec![[0.0, 0.0, 1.0]; 4],
            colors: vec![missing_color; 4],
            tex_coords: vec![[0.0, 1.0], [0.0, 0.0], [1.0, 0.0], [1.0, 1.0]],
            indices: vec![0, 1, 3, 2],
            strip_length: 4,
            edges: EdgeCache::default(),
        }
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_length(&self) -> u32 {
        self.tile_length
    }

    pub fn columns(&self) -> usize {
        self.tile_width as usize + 1
    }

    pub fn rows(&self) -> usize {
        self.tile_length as usize + 1
    }

    pub fn pixel_width(&self) -> f64 {
        self.pixel_width
    }

    pub fn pixel_length(&self) -> f64 {
        self.pixel_length
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    pub fn normals(&self) -> &[[f32; 3]] {
        &self.normals
    }

    pub fn colors(&self) -> &[[f32; 4]] {
        &self.colors
    }

    pub fn tex_coords(&self) -> &[[f32; 2]] {
        &self.tex_coords
    }

    /// The triangle strips of the mesh, one per row of cells.
    pub fn strips(&self) -> impl Iterator<Item = &[u32]> {
        self.indices.chunks(self.strip_length)
    }

    pub fn edges(&self) -> &EdgeCache {
        &self.edges
    }

    /// Size of the vertex and index buffers in bytes.
    pub fn byte_size(&self) -> usize {
        mem::size_of_val(self.positions.as_slice())
            + mem::size_of_val(self.normals.as_slice())
            + mem::size_of_val(self.colors.as_slice())
            + mem::size_of_val(self.tex_coords.as_slice())
            + mem::size_of_val(self.indices.as_slice())
    }

    fn index(&self, column: usize, row: usize) -> usize {
        row * self.columns() + column
    }

    pub fn elevation(&self, column: usize, row: usize) -> f32 {
        if self.empty {
            return self.positions[0][2];
        }

        self.positions[self.index(column, row)][2]
    }

    pub fn set_elevation(&mut self, column: usize, row: usize, elevation: f32) {
        if self.empty {
            return;
        }

        let index = self.index(column, row);
        self.positions[index][2] = elevation;
    }

    /// The normal of the vertex, or [`None`] for empty meshes.
    pub fn normal(&self, column: usize, row: usize) -> Option<[f32; 3]> {
        (!self.empty).then(|| self.normals[self.index(column, row)])
    }

    pub fn set_normal(&mut self, column: usize, row: usize, normal: [f32; 3]) {
        if self.empty {
            return;
        }

        let index = self.index(column, row);
        self.normals[index] = normal;
    }

    pub fn set_elevation_column(&mut self, column: usize, elevations: &[f32]) {
        for (row, &elevation) in elevations.iter().enumerate().take(self.rows()) {
            self.set_elevation(column, row, elevation);
        }
    }

    pub fn set_normals_column(&mut self, column: usize, normals: &[[f32; 3]]) {
        for (row, &normal) in normals.iter().enumerate().take(self.rows()) {
            self.set_normal(column, row, normal);
        }
    }

    pub fn set_elevation_row(&mut self, row: usize, elevations: &[f32]) {
        for (column, &elevation) in elevations.iter().enumerate().take(self.columns()) {
            self.set_elevation(column, row, elevation);
        }
    }

    pub fn set_normals_row(&mut self, row: usize, normals: &[[f32; 3]]) {
        for (column, &normal) in normals.iter().enumerate().take(self.columns()) {
            self.set_normal(column, row, normal);
        }
    }

    /// Replaces the samples along the edge on `side`.
    pub fn set_edge(&mut self, side: Side, elevations: &[f32], normals: &[[f32; 3]]) {
        match side {
            Side::Left => {
                self.set_elevation_column(0, elevations);
                self.set_normals_column(0, normals);
            }
            Side::Right => {
                let column = self.tile_width as usize;
                self.set_elevation_column(column, elevations);
                self.set_normals_column(column, normals);
            }
            Side::Bottom => {
                let row = self.tile_length as usize;
                self.set_elevation_row(row, elevations);
                self.set_normals_row(row, normals);
            }
            Side::Top => {
                self.set_elevation_row(0, elevations);
                self.set_normals_row(0, normals);
            }
        }
    }

    /// Number of vertices along the edge on `side`.
    pub fn edge_length(&self, side: Side) -> usize {
        if side.is_column() {
            self.rows()
        } else {
            self.columns()
        }
    }

    /// Column and row of the `index`th vertex along the edge on `side`.
    pub fn edge_vertex(&self, side: Side, index: usize) -> (usize, usize) {
        match side {
            Side::Left => (0, index),
            Side::Right => (self.tile_width as usize, index),
            Side::Bottom => (index, self.tile_length as usize),
            Side::Top => (index, 0),
        }
    }

    /// The current elevation and normal of the `index`th vertex along the edge on `side`.
    pub fn edge_post(&self, side: Side, index: usize) -> EdgePost {
        let (column, row) = self.edge_vertex(side, index);

        EdgePost {
            elevation: self.elevation(column, row),
            normal: self.normal(column, row).map_or(Vec3::Z, Vec3::from_array),
        }
    }

    /// The post `offset / scale` vertices along the edge on `side`,
    /// interpolated linearly between the two vertices around it.
    pub fn edge_post_at(&self, side: Side, offset: u64, scale: u64) -> EdgePost {
        let last = self.edge_length(side) - 1;
        let index = ((offset / scale) as usize).min(last);
        let remainder = offset % scale;

        let post = self.edge_post(side, index);

        if remainder == 0 || index == last {
            return post;
        }

        post.lerp(
            self.edge_post(side, index + 1),
            remainder as f64 / scale as f64,
        )
    }

    /// Replaces the edge on `side` by `posts`, given in edge order.
    pub fn set_edge_posts(&mut self, side: Side, posts: &[EdgePost]) {
        let elevations = posts.iter().map(|post| post.elevation).collect::<Vec<_>>();
        let normals = posts
            .iter()
            .map(|post| post.normal.to_array())
            .collect::<Vec<_>>();

        self.set_edge(side, &elevations, &normals);
    }

    /// Elevation of the post closest to `x` and `y`, measured from the lower left corner.
    pub fn elevation_nearest(&self, x: f64, y: f64) -> f32 {
        let column = ((x / self.pixel_width).round().max(0.0) as usize).min(self.tile_width as usize);
        let row = ((y / self.pixel_length).round().max(0.0) as usize).min(self.tile_length as usize);

        self.elevation(column, self.tile_length as usize - row)
    }

    /// Bilinearly interpolated elevation at `x` and `y`, measured from the lower left corner.
    pub fn elevation_bilinear(&self, x: f64, y: f64) -> f32 {
        self.bilinear(x, y, |column, row| self.elevation(column, row) as f64) as f32
    }

    /// Bilinearly interpolated normal at `x` and `y`, measured from the lower left corner.
    pub fn normal_bilinear(&self, x: f64, y: f64) -> Vec3 {
        if self.empty {
            return Vec3::Z;
        }

        let component = |axis: usize| {
            self.bilinear(x, y, |column, row| {
                self.normals[self.index(column, row)][axis] as f64
            }) as f32
        };

        Vec3::new(component(0), component(1), component(2)).normalize_or(Vec3::Z)
    }

    fn bilinear(&self, x: f64, y: f64, sample: impl Fn(usize, usize) -> f64) -> f64 {
        let (tile_width, tile_length) = (self.tile_width as f64, self.tile_length as f64);
        let x = (x / self.pixel_width).clamp(0.0, tile_width);
        let y = (y / self.pixel_length).clamp(0.0, tile_length);

        let (x0, x1) = (x.floor(), x.ceil().min(tile_width));
        let (y0, y1) = (y.floor(), y.ceil().min(tile_length));

        // rows are counted from the top
        let (c0, c1) = (x0 as usize, x1 as usize);
        let (r0, r1) = (
            self.tile_length as usize - y0 as usize,
            self.tile_length as usize - y1 as usize,
        );

        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;

        let (tx, ty) = (
            if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 },
            if y1 > y0 { (y - y0) / (y1 - y0) } else { 0.0 },
        );

        let lower = lerp(sample(c0, r0), sample(c1, r0), tx);
        let upper = lerp(sample(c0, r1), sample(c1, r1), tx);

        lerp(lower, upper, ty)
    }

    /// Recolors all vertices that currently carry the surface color.
    pub fn set_surface_color(&mut self, color: [f32; 4]) {
        if self.empty {
            return;
        }

        for vertex in &mut self.colors {
            if *vertex == self.surface_color {
                *vertex = color;
            }
        }

        self.surface_color = color;
    }

    /// Converts the mesh into a triangle list for rendering with bevy.
    pub fn to_bevy_mesh(&self) -> Mesh {
        let triangles = self
            .strips()
            .flat_map(|strip| {
                strip.windows(3).enumerate().flat_map(|(index, window)| {
                    // every other triangle of a strip has to be flipped to keep its winding
                    if index % 2 == 0 {
                        [window[0], window[1], window[2]]
                    } else {
                        [window[1], window[0], window[2]]
                    }
                })
            })
            .collect();

        Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::default(),
        )
        .with_inserted_attribute(Mesh::ATTRIBUTE_POSITION, self.positions.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_NORMAL, self.normals.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_COLOR, self.colors.clone())
        .with_inserted_attribute(Mesh::ATTRIBUTE_UV_0, self.tex_coords.clone())
        .with_inserted_indices(Indices::U32(triangles))
    }

    fn cache_edges(&mut self) {
        let mut edges = EdgeCache::default();

        for side in Side::ALL {
            let (elevations, normals) = (0..self.edge_length(side))
                .map(|index| {
                    let (column, row) = self.edge_vertex(side, index);
                    let vertex = self.index(column, row);
                    (self.positions[vertex][2], self.normals[vertex])
                })
                .unzip();

            edges.elevations[side.index()] = elevations;
            edges.normals[side.index()] = normals;
        }

        self.edges = edges;
    }
}

/// Vertex normals as the normalized sum of the normals of all adjacent triangles.
fn grid_normals(positions: &[[f32; 3]], columns: usize, rows: usize) -> Vec<[f32; 3]> {
    let mut normals = vec![Vec3::ZERO; positions.len()];

    for (row, column) in iproduct!(0..rows - 1, 0..columns - 1) {
        let top_left = row * columns + column;
        let top_right = top_left + 1;
        let bottom_left = top_left + columns;
        let bottom_right = bottom_left + 1;

        for triangle in [
            [top_left, bottom_left, top_right],
            [top_right, bottom_left, bottom_right],
        ] {
            let [a, b, c] = triangle.map(|index| Vec3::from_array(positions[index]));
            let mut normal = (b - a).cross(c - a).normalize_or_zero();

            if normal.z < 0.0 {
                normal = -normal;
            }

            for index in triangle {
                normals[index] += normal;
            }
        }
    }

    normals
        .into_iter()
        .map(|normal| normal.normalize_or(Vec3::Z).to_array())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    const WHITE: [f32; 4] = [1.0; 4];
    const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

    fn plane(tile: u32, pixel: f64, height: impl Fn(usize, usize) -> f32) -> MeshData {
        let size = tile as usize + 1;
        let samples = iproduct!(0..size, 0..size)
            .map(|(row, column)| height(column, row))
            .collect::<Vec<_>>();

        MeshData::new(&samples, tile, tile, pixel, pixel, -1.0, WHITE, RED)
    }

    #[test]
    fn grid_layout() {
        let mesh = plane(4, 2.0, |column, row| (row * 5 + column) as f32);

        assert_eq!(mesh.positions().len(), 25);
        assert_eq!(mesh.positions()[0], [-4.0, 4.0, 0.0]);
        assert_eq!(mesh.positions()[24], [4.0, -4.0, 24.0]);
        assert_eq!(mesh.tex_coords()[7], [0.5, 0.25]);
        assert_eq!(mesh.strips().count(), 4);
        assert_eq!(&mesh.strips().next().unwrap()[..4], &[0, 5, 1, 6]);
    }

    #[test]
    fn flat_normals_point_up() {
        let mesh = plane(4, 1.0, |_, _| 3.0);

        assert!(mesh.normals().iter().all(|&normal| normal == [0.0, 0.0, 1.0]));
    }

    #[test]
    fn slope_normals() {
        // rises towards the east
        let mesh = plane(4, 1.0, |column, _| column as f32);
        let normal = Vec3::from_array(mesh.normals()[12]);
        let expected = Vec3::new(-1.0, 0.0, 1.0).normalize();

        assert!((normal - expected).length() < 1e-6);
    }

    #[test]
    fn missing_samples_are_filled() {
        let mesh = plane(2, 1.0, |column, row| {
            if column == 0 && row == 0 {
                f32::NAN
            } else {
                1.0
            }
        });

        assert!(!mesh.is_empty());
        assert_eq!(mesh.elevation(0, 0), -1.0);
        assert_eq!(mesh.colors()[0], RED);
        assert_eq!(mesh.colors()[1], WHITE);
    }

    #[test]
    fn tiles_without_data_are_empty() {
        let mesh = plane(4, 1.0, |_, _| f32::NAN);

        assert!(mesh.is_empty());
        assert_eq!(mesh.positions().len(), 4);
        assert_eq!(mesh.positions()[2], [2.0, -2.0, -1.0]);
        assert_eq!(mesh.elevation(3, 3), -1.0);
        assert_eq!(mesh.normal(0, 0), None);
        assert_eq!(mesh.to_bevy_mesh().indices().map(|i| i.len()), Some(6));
    }

    #[test]
    fn cached_edges() {
        let mesh = plane(2, 1.0, |column, row| (row * 3 + column) as f32);
        let edges = mesh.edges();

        assert_eq!(edges.elevations(Side::Left), &[0.0, 3.0, 6.0]);
        assert_eq!(edges.elevations(Side::Right), &[2.0, 5.0, 8.0]);
        assert_eq!(edges.elevations(Side::Top), &[0.0, 1.0, 2.0]);
        assert_eq!(edges.elevations(Side::Bottom), &[6.0, 7.0, 8.0]);
        assert_eq!(edges.normals(Side::Bottom).len(), 3);
    }

    #[test]
    fn sampling() {
        // elevation equals x + 10 y in world units from the lower left corner
        let mesh = plane(4, 2.0, |column, row| {
            (column * 2) as f32 + 10.0 * ((4 - row) * 2) as f32
        });

        assert_eq!(mesh.elevation_nearest(0.0, 0.0), 0.0);
        assert_eq!(mesh.elevation_nearest(8.0, 8.0), 88.0);
        assert_eq!(mesh.elevation_nearest(2.9, 0.0), 2.0);
        assert!((mesh.elevation_bilinear(3.0, 5.0) - 53.0).abs() < 1e-4);
        assert!((mesh.elevation_bilinear(8.0, 8.0) - 88.0).abs() < 1e-4);
        assert!((mesh.normal_bilinear(3.0, 3.0).length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn edge_posts() {
        let mut mesh = plane(2, 1.0, |column, row| (row * 3 + column) as f32);

        assert_eq!(mesh.edge_length(Side::Left), 3);
        assert_eq!(mesh.edge_vertex(Side::Right, 1), (2, 1));
        assert_eq!(mesh.edge_vertex(Side::Bottom, 1), (1, 2));
        assert_eq!(mesh.edge_post(Side::Bottom, 1).elevation, 7.0);

        let raised = (0..3)
            .map(|index| EdgePost {
                elevation: 10.0 + index as f32,
                normal: Vec3::Z,
            })
            .collect::<Vec<_>>();
        mesh.set_edge_posts(Side::Right, &raised);

        assert_eq!(mesh.elevation(2, 0), 10.0);
        assert_eq!(mesh.elevation(2, 2), 12.0);
        assert_eq!(mesh.normal(2, 1), Some([0.0, 0.0, 1.0]));
        assert_eq!(mesh.elevation(1, 1), 4.0);

        // the cache keeps the samples the mesh was built from
        assert_eq!(mesh.edges().post(Side::Right, 2).unwrap().elevation, 8.0);
        assert_eq!(mesh.edges().post(Side::Right, 3), None);
    }

    #[test]
    fn posts_between_vertices() {
        let mesh = plane(4, 1.0, |column, row| (10 * row + column) as f32);

        // the left edge runs from 0 at the top to 40 at the bottom
        assert_eq!(mesh.edge_post_at(Side::Left, 12, 4).elevation, 30.0);
        assert_eq!(mesh.edge_post_at(Side::Left, 6, 4).elevation, 15.0);
        assert_eq!(mesh.edge_post_at(Side::Left, 3, 2).elevation, 15.0);
        assert_eq!(mesh.edge_post_at(Side::Bottom, 5, 2).elevation, 42.5);
        assert_eq!(mesh.edge_post_at(Side::Bottom, 8, 2).elevation, 44.0);
    }

    #[test]
    fn post_interpolation() {
        let low = EdgePost {
            elevation: 1.0,
            normal: Vec3::new(0.3, 0.0, 1.0),
        };
        let high = EdgePost {
            elevation: 3.0,
            normal: Vec3::Z,
        };

        // the end posts are reproduced exactly
        assert_eq!(low.lerp(high, 0.0), low);

        let middle = low.lerp(high, 0.5);
        assert_eq!(middle.elevation, 2.0);
        assert!((middle.normal.length() - 1.0).abs() < 1e-6);
        assert!(middle.normal.x > 0.0 && middle.normal.x < 0.3);
    }

    #[test]
    fn surface_color() {
        let mut mesh = plane(2, 1.0, |column, _| if column == 0 { f32::NAN } else { 0.0 });
        let blue = [0.0, 0.0, 1.0, 1.0];

        mesh.set_surface_color(blue);

        assert_eq!(mesh.colors()[0], RED);
        assert_eq!(mesh.colors()[1], blue);
    }

    #[test]
    fn triangle_list_keeps_winding() {
        let mesh = plane(1, 1.0, |_, _| 0.0).to_bevy_mesh();
        let Some(Indices::U32(indices)) = mesh.indices() else {
            panic!("indices are 32 bit");
        };

        assert_eq!(indices, &vec![0, 2, 1, 1, 2, 3]);
    }
}
