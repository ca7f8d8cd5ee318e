//! Box filters that produce the samples of coarser pyramid levels.
//!
//! Each output sample is the mean of a `kernel` by `kernel` block of the source raster,
//! starting at `top` and `left`.

use itertools::iproduct;
use ndarray::{s, ArrayView2};

/// Mean of float samples. A single `NaN` inside a block makes the whole output sample `NaN`.
pub fn mean_float(
    source: ArrayView2<f32>,
    top: usize,
    left: usize,
    columns: usize,
    rows: usize,
    kernel: usize,
) -> Vec<f32> {
    if kernel == 1 {
        return source
            .slice(s![top..top + rows, left..left + columns])
            .iter()
            .copied()
            .collect();
    }

    let count = (kernel * kernel) as f64;

    iproduct!(0..rows, 0..columns)
        .map(|(row, column)| {
            let y = top + row * kernel;
            let x = left + column * kernel;

            let sum: f64 = source
                .slice(s![y..y + kernel, x..x + kernel])
                .iter()
                .map(|&sample| sample as f64)
                .sum();

            (sum / count) as f32
        })
        .collect()
}

/// Per channel mean of packed `0xRRGGBBAA` colors.
pub fn mean_rgba(
    source: ArrayView2<u32>,
    top: usize,
    left: usize,
    columns: usize,
    rows: usize,
    kernel: usize,
) -> Vec<u32> {
    let count = (kernel * kernel) as u64;

    iproduct!(0..rows, 0..columns)
        .map(|(row, column)| {
            let y = top + row * kernel;
            let x = left + column * kernel;

            let mut sum = [0u64; 4];
            for &color in source.slice(s![y..y + kernel, x..x + kernel]) {
                for (channel, byte) in sum.iter_mut().zip(color.to_be_bytes()) {
                    *channel += byte as u64;
                }
            }

            u32::from_be_bytes(sum.map(|channel| (channel / count) as u8))
        })
        .collect()
}

/// Mean of unsigned byte samples.
pub fn mean_gray(
    source: ArrayView2<u8>,
    top: usize,
    left: usize,
    columns: usize,
    rows: usize,
    kernel: usize,
) -> Vec<u8> {
    let count = (kernel * kernel) as u64;

    iproduct!(0..rows, 0..columns)
        .map(|(row, column)| {
            let y = top + row * kernel;
            let x = left + column * kernel;

            let sum: u64 = source
                .slice(s![y..y + kernel, x..x + kernel])
                .iter()
                .map(|&sample| sample as u64)
                .sum();

            (sum / count) as u8
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn float_mean() {
        let source = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);

        assert_eq!(
            mean_float(source.view(), 0, 0, 2, 2, 2),
            vec![2.5, 4.5, 10.5, 12.5]
        );
        assert_eq!(mean_float(source.view(), 0, 0, 1, 1, 4), vec![7.5]);
        assert_eq!(mean_float(source.view(), 1, 2, 2, 1, 1), vec![6.0, 7.0]);
    }

    #[test]
    fn float_mean_propagates_missing_samples() {
        let mut source = Array2::from_elem((4, 4), 1.0f32);
        source[[3, 0]] = f32::NAN;

        let samples = mean_float(source.view(), 0, 0, 2, 2, 2);

        assert_eq!(samples[0], 1.0);
        assert!(samples[2].is_nan());
    }

    #[test]
    fn color_mean_per_channel() {
        let source = Array2::from_shape_vec(
            (2, 2),
            vec![0x10000000, 0x30000000, 0x000000ff, 0x00ff00ff],
        )
        .unwrap();

        assert_eq!(mean_rgba(source.view(), 0, 0, 1, 1, 2), vec![0x103f007f]);
    }

    #[test]
    fn gray_mean() {
        let source = Array2::from_shape_vec((2, 2), vec![255u8, 255, 0, 1]).unwrap();

        assert_eq!(mean_gray(source.view(), 0, 0, 1, 1, 2), vec![127]);
    }
}
