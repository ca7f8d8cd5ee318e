use crate::pyramid::{LayerKind, PyramidError, PyramidResult};
use itertools::Itertools;
use std::{fmt::Write as _, fs, path::Path, str::FromStr};

const LAYER_TYPE: &str = "LayerType";
const NUMBER_OF_LEVELS: &str = "NumberOfLevels";
const NUMBER_OF_TILES: &str = "NumberOfTiles";
const TILE_WIDTH: &str = "TileWidth";
const TILE_LENGTH: &str = "TileLength";
const MINIMUM_VALUE: &str = "MinimumValue";
const MAXIMUM_VALUE: &str = "MaximumValue";
const EDGE_FILL_VALUE: &str = "EdgeFillValue";
const TILE_FORMAT: &str = "TileFormat";
const SOURCE: &str = "Source";

const KNOWN_KEYS: [&str; 10] = [
    LAYER_TYPE,
    NUMBER_OF_LEVELS,
    NUMBER_OF_TILES,
    TILE_WIDTH,
    TILE_LENGTH,
    MINIMUM_VALUE,
    MAXIMUM_VALUE,
    EDGE_FILL_VALUE,
    TILE_FORMAT,
    SOURCE,
];

/// The metadata of a pyramid layer, stored as `key=value` lines next to its tiles.
///
/// Keys that are not interpreted here (for example the projection parameters) are kept
/// in their original order and written back unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerProperties {
    pub layer_kind: LayerKind,
    pub number_of_levels: u32,
    /// Tiles per side at the finest level.
    pub number_of_tiles: u32,
    /// Tile width without the shared border sample.
    pub tile_width: u32,
    pub tile_length: u32,
    /// Per band minimum sample value.
    pub minimum_value: Vec<f64>,
    /// Per band maximum sample value.
    pub maximum_value: Vec<f64>,
    /// Fill value of missing elevation samples.
    pub edge_fill_value: Option<f32>,
    pub tile_format: String,
    pub source: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl LayerProperties {
    pub const FILE_NAME: &'static str = "layer.properties";

    pub fn new(layer_kind: LayerKind, tile_width: u32, tile_length: u32) -> Self {
        Self {
            layer_kind,
            number_of_levels: 1,
            number_of_tiles: 1,
            tile_width,
            tile_length,
            minimum_value: Vec::new(),
            maximum_value: Vec::new(),
            edge_fill_value: None,
            tile_format: "PNG".to_string(),
            source: None,
            extra: Vec::new(),
        }
    }

    pub fn max_level(&self) -> u32 {
        self.number_of_levels.saturating_sub(1)
    }

    pub fn minimum(&self) -> f64 {
        self.minimum_value.first().copied().unwrap_or(0.0)
    }

    pub fn maximum(&self) -> f64 {
        self.maximum_value.first().copied().unwrap_or(0.0)
    }

    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();

        match self.extra.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.extra.push((key.to_string(), value)),
        }
    }

    pub fn parse(text: &str) -> PyramidResult<Self> {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .map(|line| match line.split_once(|c: char| c == '=' || c == ':') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect_vec();

        let get = |key: &str| {
            entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, value)| value.as_str())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| PyramidError::Metadata(format!("missing key `{key}`")))
        };

        let edge_fill_value = get(EDGE_FILL_VALUE)
            .map(|value| parse_value::<f32>(EDGE_FILL_VALUE, value))
            .transpose()?;

        Ok(Self {
            layer_kind: required(LAYER_TYPE)?.parse()?,
            number_of_levels: parse_value(NUMBER_OF_LEVELS, required(NUMBER_OF_LEVELS)?)?,
            number_of_tiles: parse_value(NUMBER_OF_TILES, required(NUMBER_OF_TILES)?)?,
            tile_width: parse_value(TILE_WIDTH, required(TILE_WIDTH)?)?,
            tile_length: parse_value(TILE_LENGTH, required(TILE_LENGTH)?)?,
            minimum_value: parse_list(MINIMUM_VALUE, required(MINIMUM_VALUE)?)?,
            maximum_value: parse_list(MAXIMUM_VALUE, required(MAXIMUM_VALUE)?)?,
            edge_fill_value,
            tile_format: get(TILE_FORMAT).unwrap_or("PNG").to_string(),
            source: get(SOURCE).map(str::to_string),
            extra: entries
                .iter()
                .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
                .cloned()
                .collect(),
        })
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();

        let _ = writeln!(text, "{LAYER_TYPE}={}", self.layer_kind);
        let _ = writeln!(text, "{NUMBER_OF_LEVELS}={}", self.number_of_levels);
        let _ = writeln!(text, "{NUMBER_OF_TILES}={}", self.number_of_tiles);
        let _ = writeln!(text, "{TILE_WIDTH}={}", self.tile_width);
        let _ = writeln!(text, "{TILE_LENGTH}={}", self.tile_length);
        let _ = writeln!(text, "{MINIMUM_VALUE}={}", self.minimum_value.iter().join(","));
        let _ = writeln!(text, "{MAXIMUM_VALUE}={}", self.maximum_value.iter().join(","));
        if let Some(edge_fill_value) = self.edge_fill_value {
            let _ = writeln!(text, "{EDGE_FILL_VALUE}={edge_fill_value}");
        }
        let _ = writeln!(text, "{TILE_FORMAT}={}", self.tile_format);
        if let Some(source) = &self.source {
            let _ = writeln!(text, "{SOURCE}={source}");
        }
        for (key, value) in &self.extra {
            let _ = writeln!(text, "{key}={value}");
        }

        text
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> PyramidResult<Self> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(PyramidError::MissingMetadata(path.to_path_buf()));
        }

        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> PyramidResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, self.to_text())?;
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> PyramidResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PyramidError::Metadata(format!("invalid value `{value}` for `{key}`")))
}

fn parse_list(key: &str, value: &str) -> PyramidResult<Vec<f64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_value(key, part))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pyramid::test::temp_directory;

    fn elevation_properties() -> LayerProperties {
        LayerProperties {
            number_of_levels: 4,
            number_of_tiles: 8,
            minimum_value: vec![-12.5],
            maximum_value: vec![3400.0],
            edge_fill_value: Some(-12.5),
            source: Some("dem.tif".to_string()),
            ..LayerProperties::new(LayerKind::Elevation, 128, 128)
        }
    }

    #[test]
    fn file_round_trip() {
        let directory = temp_directory("properties");
        let path = directory.join(LayerProperties::FILE_NAME);

        let mut properties = elevation_properties();
        properties.set_extra("ProjectionType", "Equirectangular");
        properties.set_extra("CentralMeridian", "0.0");
        properties.save_file(&path).unwrap();

        let loaded = LayerProperties::load_file(&path).unwrap();
        assert_eq!(loaded, properties);
        assert_eq!(loaded.get_extra("ProjectionType"), Some("Equirectangular"));
        assert_eq!(loaded.max_level(), 3);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn parses_comments_and_bands() {
        let text = "# written by hand\n\
                    LayerType = colorimage\n\
                    NumberOfLevels=2\n\
                    NumberOfTiles=2\n\
                    TileWidth=64\n\
                    TileLength=32\n\
                    MinimumValue=0,0,0\n\
                    MaximumValue=255,255,255\n";

        let properties = LayerProperties::parse(text).unwrap();

        assert_eq!(properties.layer_kind, LayerKind::ColorImage);
        assert_eq!(properties.tile_length, 32);
        assert_eq!(properties.maximum_value, vec![255.0; 3]);
        assert_eq!(properties.edge_fill_value, None);
        assert_eq!(properties.tile_format, "PNG");
    }

    #[test]
    fn rejects_broken_metadata() {
        assert!(matches!(
            LayerProperties::parse("LayerType=elevation\n"),
            Err(PyramidError::Metadata(_))
        ));

        let text = elevation_properties().to_text().replace("TileWidth=128", "TileWidth=wide");
        assert!(matches!(
            LayerProperties::parse(&text),
            Err(PyramidError::Metadata(_))
        ));

        assert!(matches!(
            LayerProperties::load_file("/nonexistent/layer.properties"),
            Err(PyramidError::MissingMetadata(_))
        ));
    }
}
