//! Non-learned style statistics
//!
//! A style vector summarizes a single image without a trained network. The
//! reference [`GridStyleExtractor`] averages intensity over a regular grid of
//! cells per channel: a 5x5 grid for single-channel 28x28 images (25 values)
//! and a 7x7 grid per channel for 3-channel 32x32 images (147 values).

use crate::error::DescriptorError;
use crate::tensor::Tensor;

/// Flattened length of a single-channel 28x28 image
pub const GRAY_28_FLAT_DIM: usize = 28 * 28;
/// Flattened length of a 3-channel 32x32 image
pub const RGB_32_FLAT_DIM: usize = 3 * 32 * 32;

/// Style vector length for a flattened sample size.
///
/// Used to size the random fallback for an empty class bucket, so only the
/// sizes with a known extractor output are accepted.
pub fn style_fallback_dim(sample_flat_dim: usize) -> Result<usize, DescriptorError> {
    match sample_flat_dim {
        GRAY_28_FLAT_DIM => Ok(25),
        RGB_32_FLAT_DIM => Ok(147),
        other => Err(DescriptorError::UnsupportedDescriptorDimension {
            sample_flat_dim: other,
        }),
    }
}

/// Computes a fixed-size statistical vector for one sample
pub trait StyleExtractor {
    /// Extracts the style vector of a `[C, H, W]` (or flattened) sample
    fn extract(&self, sample: &Tensor) -> Result<Vec<f32>, DescriptorError>;
}

/// Per-channel mean intensity over a grid of cells
#[derive(Debug, Clone, Copy, Default)]
pub struct GridStyleExtractor;

impl GridStyleExtractor {
    /// Creates the extractor
    pub fn new() -> Self {
        Self
    }

    fn grid_size(channels: usize) -> Result<usize, DescriptorError> {
        match channels {
            1 => Ok(5),
            3 => Ok(7),
            other => Err(DescriptorError::InvalidSample {
                reason: format!("no style grid for {other} channels"),
            }),
        }
    }

    fn image_dims(sample: &Tensor) -> Result<(usize, usize, usize), DescriptorError> {
        match sample.shape().dims() {
            [c, h, w] => Ok((*c, *h, *w)),
            [1, c, h, w] => Ok((*c, *h, *w)),
            [GRAY_28_FLAT_DIM] => Ok((1, 28, 28)),
            [RGB_32_FLAT_DIM] => Ok((3, 32, 32)),
            other => Err(DescriptorError::InvalidSample {
                reason: format!("cannot read {other:?} as an image"),
            }),
        }
    }
}

impl StyleExtractor for GridStyleExtractor {
    fn extract(&self, sample: &Tensor) -> Result<Vec<f32>, DescriptorError> {
        let (channels, height, width) = Self::image_dims(sample)?;
        let grid = Self::grid_size(channels)?;
        if height < grid || width < grid {
            return Err(DescriptorError::InvalidSample {
                reason: format!("{height}x{width} image is smaller than a {grid}x{grid} grid"),
            });
        }

        let data = sample.data();
        let plane = height * width;
        let mut style = Vec::with_capacity(channels * grid * grid);
        for c in 0..channels {
            for gy in 0..grid {
                let (y0, y1) = (gy * height / grid, (gy + 1) * height / grid);
                for gx in 0..grid {
                    let (x0, x1) = (gx * width / grid, (gx + 1) * width / grid);
                    let mut sum = 0.0f32;
                    for y in y0..y1 {
                        let row = c * plane + y * width;
                        sum += data[row + x0..row + x1].iter().sum::<f32>();
                    }
                    style.push(sum / ((y1 - y0) * (x1 - x0)) as f32);
                }
            }
        }
        Ok(style)
    }
}
