//! Sample and label transforms
//!
//! Clients corrupt or augment their local partition according to a symbolic
//! instruction sent by the orchestrator (`"rotate90"`, `"invert"`,
//! `"label_flip_2"`, ...). [`TransformSelector::select`] maps the instruction
//! to a [`TransformPair`]: a composed image pipeline that always ends with
//! tensor conversion, and an optional label remapping.
//!
//! # Instructions
//!
//! | instruction      | sample pipeline                          | label         |
//! |------------------|------------------------------------------|---------------|
//! | `solarize`       | RandomSolarize(threshold 200, p 0.5)     | -             |
//! | `invert`         | Invert                                   | -             |
//! | `equalize`       | Equalize                                 | -             |
//! | `elastic`        | Elastic(alpha 100, sigma 5)              | -             |
//! | `rotateD`        | Rotate(D degrees, counter-clockwise)     | -             |
//! | `label_flip_N`   | -                                        | LabelFlip(N)  |
//! | anything else    | -                                        | -             |
//!
//! Every pipeline ends with `ToTensor`.

use std::fmt;

use image::{imageops, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::geometric_transformations::{rotate_about_center, warp_with, Interpolation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DescriptorError, ModelError};
use crate::tensor::{Tensor, TensorShape};

/// Number of classes label flips wrap around by default
pub const DEFAULT_NUM_CLASSES: usize = 10;

/// 8-bit grayscale or RGB image
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    /// Single channel
    Gray(GrayImage),
    /// Three interleaved channels
    Rgb(RgbImage),
}

impl Image {
    /// Creates an image from raw HWC pixels; 1 or 3 channels
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        pixels: Vec<u8>,
    ) -> Result<Self, ModelError> {
        let invalid = |reason: String| ModelError::InvalidTensor { reason };
        if pixels.len() != width * height * channels {
            return Err(invalid(format!(
                "{} pixels for a {width}x{height}x{channels} image",
                pixels.len()
            )));
        }
        let w = u32::try_from(width).map_err(|_| invalid(format!("width {width} too large")))?;
        let h = u32::try_from(height).map_err(|_| invalid(format!("height {height} too large")))?;
        let image = match channels {
            1 => GrayImage::from_raw(w, h, pixels).map(Image::Gray),
            3 => RgbImage::from_raw(w, h, pixels).map(Image::Rgb),
            n => return Err(invalid(format!("{n} channels, expected 1 or 3"))),
        };
        image.ok_or_else(|| invalid(format!("buffer does not fit {width}x{height}x{channels}")))
    }

    /// Creates an image by evaluating `f(x, y, c)` for every pixel
    pub fn from_fn(
        width: usize,
        height: usize,
        channels: usize,
        mut f: impl FnMut(usize, usize, usize) -> u8,
    ) -> Result<Self, ModelError> {
        let mut pixels = Vec::with_capacity(width * height * channels);
        for y in 0..height {
            for x in 0..width {
                for c in 0..channels {
                    pixels.push(f(x, y, c));
                }
            }
        }
        Self::new(width, height, channels, pixels)
    }

    /// Image width
    pub fn width(&self) -> usize {
        match self {
            Image::Gray(b) => b.width() as usize,
            Image::Rgb(b) => b.width() as usize,
        }
    }

    /// Image height
    pub fn height(&self) -> usize {
        match self {
            Image::Gray(b) => b.height() as usize,
            Image::Rgb(b) => b.height() as usize,
        }
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        match self {
            Image::Gray(_) => 1,
            Image::Rgb(_) => 3,
        }
    }

    /// Raw HWC pixels
    pub fn pixels(&self) -> &[u8] {
        match self {
            Image::Gray(b) => b.as_raw(),
            Image::Rgb(b) => b.as_raw(),
        }
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        match self {
            Image::Gray(b) => &mut **b,
            Image::Rgb(b) => &mut **b,
        }
    }

    /// Pixel value at `(x, y)` in channel `c`
    pub fn get(&self, x: usize, y: usize, c: usize) -> u8 {
        self.pixels()[(y * self.width() + x) * self.channels() + c]
    }

    /// Converts to a `[C, H, W]` tensor scaled to `[0, 1]`
    pub fn to_tensor(&self) -> Tensor {
        let (w, h, channels) = (self.width(), self.height(), self.channels());
        let pixels = self.pixels();
        let mut data = Vec::with_capacity(pixels.len());
        for c in 0..channels {
            for y in 0..h {
                for x in 0..w {
                    data.push(f32::from(pixels[(y * w + x) * channels + c]) / 255.0);
                }
            }
        }
        Tensor::new(data, TensorShape::d3(channels, h, w))
            .unwrap_or_else(|_| Tensor::from_vec(Vec::new()))
    }
}

/// Converts a `[3, H, W]` tensor to `[1, H, W]` with ITU-R 601 luma weights.
///
/// Single-channel tensors are returned unchanged.
pub fn grayscale_tensor(sample: &Tensor) -> Result<Tensor, DescriptorError> {
    let dims = sample.shape().dims();
    match dims {
        [1, _, _] => Ok(sample.clone()),
        [3, h, w] => {
            let plane = h * w;
            let data = sample.data();
            let gray: Vec<f32> = (0..plane)
                .map(|i| 0.2989 * data[i] + 0.587 * data[plane + i] + 0.114 * data[2 * plane + i])
                .collect();
            Tensor::new(gray, TensorShape::d3(1, *h, *w)).map_err(|e| {
                DescriptorError::InvalidSample {
                    reason: e.to_string(),
                }
            })
        }
        other => Err(DescriptorError::InvalidSample {
            reason: format!("expected a [C, H, W] image tensor, got {other:?}"),
        }),
    }
}

/// A single image operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageOp {
    /// Counter-clockwise rotation about the image center, size preserved
    Rotate {
        /// Angle in degrees
        degrees: u32,
    },
    /// `255 - p` on every channel
    Invert,
    /// Per-channel histogram equalization
    Equalize,
    /// With probability `p`, invert every pixel at or above `threshold`
    RandomSolarize {
        /// Inversion threshold
        threshold: u8,
        /// Application probability
        p: f64,
    },
    /// Random smooth displacement field applied with bilinear resampling
    Elastic {
        /// Displacement magnitude
        alpha: f64,
        /// Smoothing of the displacement field
        sigma: f64,
    },
}

impl ImageOp {
    /// Applies the operation
    pub fn apply<R: Rng + ?Sized>(&self, image: &Image, rng: &mut R) -> Image {
        match (self, image) {
            (ImageOp::Rotate { degrees }, Image::Gray(b)) => Image::Gray(rotate(b, *degrees)),
            (ImageOp::Rotate { degrees }, Image::Rgb(b)) => Image::Rgb(rotate(b, *degrees)),
            (ImageOp::Invert, _) => {
                let mut out = image.clone();
                match &mut out {
                    Image::Gray(b) => imageops::invert(b),
                    Image::Rgb(b) => imageops::invert(b),
                }
                out
            }
            (ImageOp::Equalize, Image::Gray(b)) => Image::Gray(equalize_histogram(b)),
            (ImageOp::Equalize, Image::Rgb(b)) => Image::Rgb(equalize_rgb(b)),
            (ImageOp::RandomSolarize { threshold, p }, _) => {
                let mut out = image.clone();
                if rng.gen::<f64>() < *p {
                    for v in out.pixels_mut() {
                        if *v >= *threshold {
                            *v = 255 - *v;
                        }
                    }
                }
                out
            }
            (ImageOp::Elastic { alpha, sigma }, Image::Gray(b)) => {
                Image::Gray(elastic(b, *alpha, *sigma, rng))
            }
            (ImageOp::Elastic { alpha, sigma }, Image::Rgb(b)) => {
                Image::Rgb(elastic(b, *alpha, *sigma, rng))
            }
        }
    }
}

impl fmt::Display for ImageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageOp::Rotate { degrees } => write!(f, "Rotate({degrees})"),
            ImageOp::Invert => write!(f, "Invert"),
            ImageOp::Equalize => write!(f, "Equalize"),
            ImageOp::RandomSolarize { threshold, p } => {
                write!(f, "RandomSolarize(threshold={threshold}, p={p})")
            }
            ImageOp::Elastic { alpha, sigma } => write!(f, "Elastic(alpha={alpha}, sigma={sigma})"),
        }
    }
}

fn black<P: Pixel<Subpixel = u8>>() -> P {
    *P::from_slice(&[0u8; 4][..usize::from(P::CHANNEL_COUNT)])
}

fn rotate<P>(buffer: &ImageBuffer<P, Vec<u8>>, degrees: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + Send + Sync + 'static,
{
    // imageops turns clockwise
    match degrees % 360 {
        0 => buffer.clone(),
        90 => imageops::rotate270(buffer),
        180 => imageops::rotate180(buffer),
        270 => imageops::rotate90(buffer),
        d => rotate_about_center(
            buffer,
            -(d as f32).to_radians(),
            Interpolation::Nearest,
            black(),
        ),
    }
}

fn equalize_rgb(buffer: &RgbImage) -> RgbImage {
    let planes: Vec<GrayImage> = (0..3)
        .map(|c| {
            let plane = GrayImage::from_fn(buffer.width(), buffer.height(), |x, y| {
                Luma([buffer.get_pixel(x, y)[c]])
            });
            equalize_histogram(&plane)
        })
        .collect();
    RgbImage::from_fn(buffer.width(), buffer.height(), |x, y| {
        Rgb([
            planes[0].get_pixel(x, y)[0],
            planes[1].get_pixel(x, y)[0],
            planes[2].get_pixel(x, y)[0],
        ])
    })
}

fn elastic<P, R>(
    buffer: &ImageBuffer<P, Vec<u8>>,
    alpha: f64,
    sigma: f64,
    rng: &mut R,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + Send + Sync + 'static,
    R: Rng + ?Sized,
{
    let (w, h) = buffer.dimensions();
    if w == 0 || h == 0 {
        return buffer.clone();
    }
    // Noise in [0, 1]; blur clamps float pixels to that range
    let mut field = || -> ImageBuffer<Luma<f32>, Vec<f32>> {
        let noise = ImageBuffer::from_fn(w, h, |_, _| Luma([rng.gen::<f32>()]));
        imageops::blur(&noise, sigma as f32)
    };
    let dx = field();
    let dy = field();
    // Displacements are relative to the image size, in pixels
    let scale_x = (alpha / f64::from(h) * f64::from(w) / 2.0) as f32;
    let scale_y = (alpha / 2.0) as f32;
    warp_with(
        buffer,
        move |x, y| {
            let (xi, yi) = ((x as u32).min(w - 1), (y as u32).min(h - 1));
            let ddx = 2.0 * dx.get_pixel(xi, yi)[0] - 1.0;
            let ddy = 2.0 * dy.get_pixel(xi, yi)[0] - 1.0;
            (x + ddx * scale_x, y + ddy * scale_y)
        },
        Interpolation::Bilinear,
        black(),
    )
}

/// Composed image pipeline; `apply` always finishes with tensor conversion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleTransform {
    ops: Vec<ImageOp>,
}

impl SampleTransform {
    /// Pipeline that only converts to a tensor
    pub fn identity() -> Self {
        Self::default()
    }

    /// Pipeline of `ops` followed by tensor conversion
    pub fn compose(ops: Vec<ImageOp>) -> Self {
        Self { ops }
    }

    /// Image operations before tensor conversion
    pub fn ops(&self) -> &[ImageOp] {
        &self.ops
    }

    /// True when the pipeline is tensor conversion only
    pub fn is_identity(&self) -> bool {
        self.ops.is_empty()
    }

    /// Runs the pipeline
    pub fn apply<R: Rng + ?Sized>(&self, image: &Image, rng: &mut R) -> Tensor {
        let mut current = image.clone();
        for op in &self.ops {
            current = op.apply(&current, rng);
        }
        current.to_tensor()
    }
}

impl fmt::Display for SampleTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compose(")?;
        for op in &self.ops {
            write!(f, "{op}, ")?;
        }
        write!(f, "ToTensor)")
    }
}

/// Deterministic label corruption `L -> (L + shift) mod n_classes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFlip {
    shift: usize,
    n_classes: usize,
}

impl LabelFlip {
    /// Creates a flip by `shift` classes
    pub fn new(shift: usize, n_classes: usize) -> Self {
        Self {
            shift,
            n_classes: n_classes.max(1),
        }
    }

    /// Shift parameter
    pub fn shift(&self) -> usize {
        self.shift
    }

    /// Remaps a ground-truth label
    pub fn apply(&self, label: usize) -> usize {
        (label + self.shift) % self.n_classes
    }
}

/// Sample pipeline plus optional label corruption for one instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPair {
    /// Instruction this pair was built from
    pub instruction: String,
    /// Image pipeline
    pub sample: SampleTransform,
    /// Label corruption, only for `label_flip_N`
    pub label: Option<LabelFlip>,
}

impl TransformPair {
    /// Identity pipeline, no label corruption
    pub fn identity() -> Self {
        Self {
            instruction: String::new(),
            sample: SampleTransform::identity(),
            label: None,
        }
    }

    /// Transforms one `(image, label)` sample
    pub fn apply<R: Rng + ?Sized>(&self, image: &Image, label: usize, rng: &mut R) -> (Tensor, usize) {
        let tensor = self.sample.apply(image, rng);
        let label = self.label.map_or(label, |flip| flip.apply(label));
        (tensor, label)
    }
}

/// Maps instructions to transform pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSelector {
    n_classes: usize,
}

impl Default for TransformSelector {
    fn default() -> Self {
        Self {
            n_classes: DEFAULT_NUM_CLASSES,
        }
    }
}

impl TransformSelector {
    /// Selector whose label flips wrap around `n_classes`
    pub fn with_classes(n_classes: usize) -> Self {
        Self { n_classes }
    }

    /// Builds the transform pair for `instruction`.
    ///
    /// Unknown instructions yield the identity pipeline with no label
    /// corruption.
    pub fn select(&self, instruction: &str) -> TransformPair {
        let ops = match instruction {
            "solarize" => vec![ImageOp::RandomSolarize {
                threshold: 200,
                p: 0.5,
            }],
            "invert" => vec![ImageOp::Invert],
            "equalize" => vec![ImageOp::Equalize],
            "elastic" => vec![ImageOp::Elastic {
                alpha: 100.0,
                sigma: 5.0,
            }],
            other => match other.strip_prefix("rotate").and_then(|d| d.parse::<u32>().ok()) {
                Some(degrees) => vec![ImageOp::Rotate { degrees }],
                None => Vec::new(),
            },
        };

        let label = instruction
            .strip_prefix("label_flip_")
            .and_then(|n| n.parse::<usize>().ok())
            .map(|shift| LabelFlip::new(shift, self.n_classes));

        if ops.is_empty() && label.is_none() {
            debug!("No transform for instruction {:?}, using identity", instruction);
        }

        TransformPair {
            instruction: instruction.to_string(),
            sample: SampleTransform::compose(ops),
            label,
        }
    }
}

/// Selects with the default number of classes
pub fn select(instruction: &str) -> TransformPair {
    TransformSelector::default().select(instruction)
}
