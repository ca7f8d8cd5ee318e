use crate::pyramid::{
    raster::{RasterSamples, SampleSource},
    LayerKind, PyramidError, PyramidResult,
};
use ndarray::Array2;
use std::{fs::File, io::BufReader, path::Path};
use tiff::{
    decoder::{Decoder, DecodingResult, Limits},
    tags::Tag,
    ColorType,
};

/// A [`SampleSource`] reading the first image of a TIFF file.
///
/// Single band rasters of any numeric type are read as floats, except for 8 and 16 bit
/// rasters which can also be read as gray images. RGB and RGBA rasters are read as packed colors.
pub struct TiffSource {
    decoder: Decoder<BufReader<File>>,
    width: u32,
    length: u32,
    samples_per_pixel: u32,
    missing_value: Option<f64>,
    as_float: bool,
}

impl TiffSource {
    pub fn open<P: AsRef<Path>>(path: P) -> PyramidResult<Self> {
        let file = BufReader::new(File::open(path)?);
        let mut decoder = Decoder::new(file)?.with_limits(Limits::unlimited());

        let (width, length) = decoder.dimensions()?;
        let samples_per_pixel = match decoder.colortype()? {
            ColorType::RGB(_) => 3,
            ColorType::RGBA(_) => 4,
            ColorType::GrayA(_) => 2,
            _ => 1,
        };

        // GDAL stores the no data value as an ascii tag
        let missing_value = decoder
            .get_tag_ascii_string(Tag::Unknown(42113))
            .ok()
            .and_then(|value| value.trim_matches(char::from(0)).trim().parse().ok());

        Ok(Self {
            decoder,
            width,
            length,
            samples_per_pixel,
            missing_value,
            as_float: true,
        })
    }

    /// Reads single band rasters as gray images instead of floats.
    pub fn with_gray_bytes(mut self) -> Self {
        self.as_float = false;
        self
    }
}

impl SampleSource for TiffSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.length)
    }

    fn samples_per_pixel(&self) -> u32 {
        self.samples_per_pixel
    }

    fn missing_value(&self) -> Option<f64> {
        self.missing_value
    }

    fn read(&mut self) -> PyramidResult<RasterSamples> {
        let shape = (self.length as usize, self.width as usize);
        let image = self.decoder.read_image()?;

        if self.samples_per_pixel > 1 {
            let bytes = match image {
                DecodingResult::U8(data) => data,
                DecodingResult::U16(data) => data.into_iter().map(|v| (v >> 8) as u8).collect(),
                _ => return Err(tiff::TiffError::UnsupportedError(
                    tiff::TiffUnsupportedError::UnknownInterpretation,
                )
                .into()),
            };

            let channels = self.samples_per_pixel as usize;
            let colors = bytes
                .chunks_exact(channels)
                .map(|pixel| match channels {
                    2 => u32::from_be_bytes([pixel[0], pixel[0], pixel[0], pixel[1]]),
                    3 => u32::from_be_bytes([pixel[0], pixel[1], pixel[2], u8::MAX]),
                    _ => u32::from_be_bytes([pixel[0], pixel[1], pixel[2], pixel[3]]),
                })
                .collect();

            return Ok(RasterSamples::Rgba(shape_array(shape, colors)?));
        }

        if !self.as_float {
            // 16 bit gray keeps its high byte, like 16 bit color channels
            let bytes = match image {
                DecodingResult::U8(data) => data,
                DecodingResult::U16(data) => data.into_iter().map(|v| (v >> 8) as u8).collect(),
                other => {
                    return Err(PyramidError::UnsupportedSampleFormat {
                        kind: LayerKind::GrayImage,
                        format: sample_format(&other),
                    })
                }
            };

            return Ok(RasterSamples::Gray(shape_array(shape, bytes)?));
        }

        let samples: Vec<f32> = match image {
            DecodingResult::U8(data) => data.into_iter().map(f32::from).collect(),
            DecodingResult::U16(data) => data.into_iter().map(f32::from).collect(),
            DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I8(data) => data.into_iter().map(f32::from).collect(),
            DecodingResult::I16(data) => data.into_iter().map(f32::from).collect(),
            DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
            DecodingResult::F32(data) => data,
            DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        };

        Ok(RasterSamples::Float(shape_array(shape, samples)?))
    }
}

fn sample_format(image: &DecodingResult) -> &'static str {
    match image {
        DecodingResult::U8(_) => "u8",
        DecodingResult::U16(_) => "u16",
        DecodingResult::U32(_) => "u32",
        DecodingResult::U64(_) => "u64",
        DecodingResult::F32(_) => "f32",
        DecodingResult::F64(_) => "f64",
        DecodingResult::I8(_) => "i8",
        DecodingResult::I16(_) => "i16",
        DecodingResult::I32(_) => "i32",
        DecodingResult::I64(_) => "i64",
    }
}

fn shape_array<T>(shape: (usize, usize), data: Vec<T>) -> PyramidResult<Array2<T>> {
    Array2::from_shape_vec(shape, data).map_err(|error| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string()).into()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pyramid::test::temp_directory;
    use std::fs;
    use tiff::encoder::{colortype, TiffEncoder};

    #[test]
    fn reads_float_rasters() {
        let directory = temp_directory("tiff");
        let path = directory.join("dem.tif");

        let samples = (0..12).map(|v| v as f32 * 0.5).collect::<Vec<_>>();
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(4, 3, &samples)
            .unwrap();

        let mut source = TiffSource::open(&path).unwrap();
        assert_eq!(source.dimensions(), (4, 3));
        assert_eq!(source.samples_per_pixel(), 1);

        let RasterSamples::Float(raster) = source.read().unwrap() else {
            panic!("float rasters are read as floats");
        };
        assert_eq!(raster[[2, 1]], 4.5);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn reads_16_bit_gray_images() {
        let directory = temp_directory("tiff_gray16");
        let path = directory.join("gray.tif");

        let samples = [0u16, 0x0100, 0x8000, 0xffff];
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder.write_image::<colortype::Gray16>(2, 2, &samples).unwrap();

        let mut source = TiffSource::open(&path).unwrap().with_gray_bytes();
        let RasterSamples::Gray(raster) = source.read().unwrap() else {
            panic!("16 bit rasters are read as gray images");
        };
        assert_eq!(raster.iter().copied().collect::<Vec<_>>(), vec![0, 1, 128, 255]);

        // as elevation the full range is kept
        let RasterSamples::Float(raster) = TiffSource::open(&path).unwrap().read().unwrap() else {
            panic!("16 bit rasters are read as floats");
        };
        assert_eq!(raster[[1, 1]], 65535.0);

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn rejects_float_gray_images() {
        let directory = temp_directory("tiff_float_gray");
        let path = directory.join("gray.tif");

        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(2, 1, &[0.25, 0.5])
            .unwrap();

        let error = TiffSource::open(&path)
            .unwrap()
            .with_gray_bytes()
            .read()
            .unwrap_err();
        assert!(matches!(
            error,
            PyramidError::UnsupportedSampleFormat { format: "f32", .. }
        ));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn reads_color_rasters() {
        let directory = temp_directory("tiff_color");
        let path = directory.join("image.tif");

        let pixels = [255u8, 0, 0, 0, 255, 0];
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder.write_image::<colortype::RGB8>(2, 1, &pixels).unwrap();

        let mut source = TiffSource::open(&path).unwrap();
        assert_eq!(source.samples_per_pixel(), 3);

        let RasterSamples::Rgba(raster) = source.read().unwrap() else {
            panic!("color rasters are read as packed colors");
        };
        assert_eq!(raster[[0, 0]], 0xff0000ff);
        assert_eq!(raster[[0, 1]], 0x00ff00ff);

        fs::remove_dir_all(directory).unwrap();
    }
}
