use bevy::math::DVec2;
use derive_more::Display;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// One of the four children of a quadtree node.
///
/// The discriminant is the digit used in string keys and on disk.
/// North is the top of the raster (row zero), west is column zero.
#[derive(Copy, Clone, Debug, Display, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Quadrant {
    #[display("1")]
    NorthWest = 1,
    #[display("2")]
    NorthEast = 2,
    #[display("3")]
    SouthWest = 3,
    #[display("4")]
    SouthEast = 4,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::NorthWest,
        Quadrant::NorthEast,
        Quadrant::SouthWest,
        Quadrant::SouthEast,
    ];

    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            1 => Some(Quadrant::NorthWest),
            2 => Some(Quadrant::NorthEast),
            3 => Some(Quadrant::SouthWest),
            4 => Some(Quadrant::SouthEast),
            _ => None,
        }
    }

    pub fn digit(self) -> u8 {
        self as u8
    }

    /// Index of this quadrant inside a children array.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn is_east(self) -> bool {
        matches!(self, Quadrant::NorthEast | Quadrant::SouthEast)
    }

    pub fn is_south(self) -> bool {
        matches!(self, Quadrant::SouthWest | Quadrant::SouthEast)
    }

    /// The horizontally adjacent quadrant inside the same parent.
    pub fn mirror_horizontal(self) -> Self {
        match self {
            Quadrant::NorthWest => Quadrant::NorthEast,
            Quadrant::NorthEast => Quadrant::NorthWest,
            Quadrant::SouthWest => Quadrant::SouthEast,
            Quadrant::SouthEast => Quadrant::SouthWest,
        }
    }

    /// The vertically adjacent quadrant inside the same parent.
    pub fn mirror_vertical(self) -> Self {
        match self {
            Quadrant::NorthWest => Quadrant::SouthWest,
            Quadrant::NorthEast => Quadrant::SouthEast,
            Quadrant::SouthWest => Quadrant::NorthWest,
            Quadrant::SouthEast => Quadrant::NorthEast,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseTileAddressError {
    #[error("tile address must start with '/' unless it is the root")]
    MissingSeparator,
    #[error("invalid quadrant digit `{0}`")]
    InvalidQuadrant(String),
}

/// The path based identifier of a quadtree node.
///
/// Each level of the tree appends one [`Quadrant`], so the length of the path is the
/// depth of the node and the root is the empty path.
/// The string form is `/q1/q2/.../qN`, with the root being the empty string.
#[derive(Clone, Default, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileAddress {
    path: Vec<Quadrant>,
}

impl TileAddress {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_quadrants(path: impl IntoIterator<Item = Quadrant>) -> Self {
        Self {
            path: path.into_iter().collect(),
        }
    }

    /// Derives the address of the tile at `column` and `row` of a grid with `tiles_per_side`
    /// tiles at `level`, by bisecting the grid once per level.
    pub fn from_grid(column: u32, row: u32, tiles_per_side: u32, level: u32) -> Self {
        let mut path = Vec::with_capacity(level as usize);
        let (mut x_line, mut y_line) = (0, 0);
        let mut size = tiles_per_side;

        for _ in 0..level {
            size /= 2;

            let east = column >= x_line + size;
            let south = row >= y_line + size;

            if east {
                x_line += size;
            }
            if south {
                y_line += size;
            }

            path.push(match (east, south) {
                (false, false) => Quadrant::NorthWest,
                (true, false) => Quadrant::NorthEast,
                (false, true) => Quadrant::SouthWest,
                (true, true) => Quadrant::SouthEast,
            });
        }

        Self { path }
    }

    pub fn child(&self, quadrant: Quadrant) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.extend_from_slice(&self.path);
        path.push(quadrant);
        Self { path }
    }

    pub fn children(&self) -> [Self; 4] {
        Quadrant::ALL.map(|quadrant| self.child(quadrant))
    }

    pub fn parent(&self) -> Option<Self> {
        self.ancestor(self.level().checked_sub(1)?)
    }

    /// The ancestor of this node at the shallower `level`.
    pub fn ancestor(&self, level: u32) -> Option<Self> {
        (level <= self.level()).then(|| Self {
            path: self.path[..level as usize].to_vec(),
        })
    }

    pub fn level(&self) -> u32 {
        self.path.len() as u32
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// The quadrant chosen at depth `index`, i.e. when descending from level `index`
    /// to level `index + 1`.
    pub fn quadrant_at(&self, index: u32) -> Option<Quadrant> {
        self.path.get(index as usize).copied()
    }

    /// The quadrant of this node inside its parent, [`None`] for the root.
    pub fn quadrant(&self) -> Option<Quadrant> {
        self.path.last().copied()
    }

    pub fn quadrants(&self) -> &[Quadrant] {
        &self.path
    }

    pub fn starts_with(&self, prefix: &TileAddress) -> bool {
        self.path.starts_with(&prefix.path)
    }

    /// Column and row of this node among the `2^level` by `2^level` nodes of its level,
    /// counted from the north west corner.
    pub fn grid_position(&self) -> (u64, u64) {
        self.path.iter().fold((0, 0), |(column, row), quadrant| {
            (
                2 * column + quadrant.is_east() as u64,
                2 * row + quadrant.is_south() as u64,
            )
        })
    }

    /// The center of this node relative to the center of the whole terrain,
    /// which spans `width` by `length` world units. North is positive y.
    pub fn center(&self, width: f64, length: f64) -> DVec2 {
        let mut half = DVec2::new(width, length) / 2.0;
        let mut center = DVec2::ZERO;

        for quadrant in &self.path {
            half /= 2.0;

            center += match quadrant {
                Quadrant::NorthWest => DVec2::new(-half.x, half.y),
                Quadrant::NorthEast => DVec2::new(half.x, half.y),
                Quadrant::SouthWest => DVec2::new(-half.x, -half.y),
                Quadrant::SouthEast => DVec2::new(half.x, -half.y),
            };
        }

        center
    }

    /// The file of this node's tile inside a pyramid layer directory.
    pub fn path(&self, directory: &Path, extension: &str) -> PathBuf {
        let mut path = directory.to_path_buf();
        path.extend(self.path.iter().map(|quadrant| quadrant.to_string()));
        path.push(format!("0.{extension}"));
        path
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for quadrant in &self.path {
            write!(f, "/{quadrant}")?;
        }
        Ok(())
    }
}

impl FromStr for TileAddress {
    type Err = ParseTileAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }

        let rest = s
            .strip_prefix('/')
            .ok_or(ParseTileAddressError::MissingSeparator)?;

        let path = rest
            .split('/')
            .map(|part| {
                part.parse::<u8>()
                    .ok()
                    .and_then(Quadrant::from_digit)
                    .ok_or_else(|| ParseTileAddressError::InvalidQuadrant(part.to_string()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { path })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;

    fn random_address(rng: &mut impl Rng, max_level: u32) -> TileAddress {
        let level = rng.random_range(0..=max_level);
        TileAddress::from_quadrants(
            (0..level).map(|_| Quadrant::ALL[rng.random_range(0..4)]),
        )
    }

    #[test]
    fn string_round_trip() {
        let mut rng = rand::rng();

        for _ in 0..200 {
            let address = random_address(&mut rng, 12);
            let parsed = address.to_string().parse::<TileAddress>().unwrap();
            assert_eq!(parsed, address);
        }

        assert_eq!(TileAddress::root().to_string(), "");
        assert_eq!(
            TileAddress::root()
                .child(Quadrant::NorthEast)
                .child(Quadrant::SouthWest)
                .to_string(),
            "/2/3"
        );
    }

    #[test]
    fn rejects_invalid_keys() {
        assert!("/5".parse::<TileAddress>().is_err());
        assert!("1/2".parse::<TileAddress>().is_err());
        assert!("/1//2".parse::<TileAddress>().is_err());
    }

    #[test]
    fn parent_and_ancestors() {
        let address: TileAddress = "/1/4/2".parse().unwrap();

        assert_eq!(address.level(), 3);
        assert_eq!(address.quadrant(), Some(Quadrant::NorthEast));
        assert_eq!(address.quadrant_at(1), Some(Quadrant::SouthEast));
        assert_eq!(address.parent().unwrap().to_string(), "/1/4");
        assert_eq!(address.ancestor(1).unwrap().to_string(), "/1");
        assert!(address.ancestor(4).is_none());
        assert!(address.starts_with(&"/1/4".parse().unwrap()));
        assert!(!address.starts_with(&"/2".parse().unwrap()));
        assert!(TileAddress::root().parent().is_none());
        assert_eq!(TileAddress::root().quadrant(), None);
    }

    #[test]
    fn center_of_root_is_origin() {
        assert_eq!(TileAddress::root().center(100.0, 50.0), DVec2::ZERO);
    }

    #[test]
    fn center_matches_grid_position() {
        let mut rng = rand::rng();
        let (width, length) = (1024.0, 512.0);

        for _ in 0..100 {
            let level = rng.random_range(0..8);
            let tiles = 1u32 << level;
            let column = rng.random_range(0..tiles);
            let row = rng.random_range(0..tiles);

            let address = TileAddress::from_grid(column, row, tiles, level);
            let center = address.center(width, length);

            let tile_width = width / tiles as f64;
            let tile_length = length / tiles as f64;
            let expected = DVec2::new(
                -width / 2.0 + (column as f64 + 0.5) * tile_width,
                length / 2.0 - (row as f64 + 0.5) * tile_length,
            );

            assert!((center - expected).length() < 1e-9);
        }
    }

    #[test]
    fn grid_addresses_follow_quadrant_order() {
        assert_eq!(TileAddress::from_grid(0, 0, 1, 0), TileAddress::root());
        assert_eq!(TileAddress::from_grid(1, 0, 2, 1).to_string(), "/2");
        assert_eq!(TileAddress::from_grid(0, 1, 2, 1).to_string(), "/3");
        assert_eq!(TileAddress::from_grid(3, 2, 4, 2).to_string(), "/4/2");
        assert_eq!(TileAddress::from_grid(2, 3, 4, 2).to_string(), "/4/3");
    }

    #[test]
    fn grid_positions() {
        let mut rng = rand::rng();

        assert_eq!(TileAddress::root().grid_position(), (0, 0));
        assert_eq!("/4/2".parse::<TileAddress>().unwrap().grid_position(), (3, 1));

        for _ in 0..100 {
            let level = rng.random_range(0..10);
            let tiles = 1u32 << level;
            let column = rng.random_range(0..tiles);
            let row = rng.random_range(0..tiles);

            let address = TileAddress::from_grid(column, row, tiles, level);
            assert_eq!(address.grid_position(), (column as u64, row as u64));
        }
    }

    #[test]
    fn tile_paths() {
        let directory = Path::new("layer");

        assert_eq!(
            TileAddress::root().path(directory, "png"),
            PathBuf::from("layer/0.png")
        );
        assert_eq!(
            "/3/1".parse::<TileAddress>().unwrap().path(directory, "png"),
            PathBuf::from("layer/3/1/0.png")
        );
    }
}
