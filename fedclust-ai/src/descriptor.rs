//! Per-class descriptor extraction
//!
//! A client summarizes its local partition as one vector per class, either
//! the mean embedding produced by an encoder network or the mean style
//! vector of its samples. The per-class vectors are concatenated in class
//! order and sent to the orchestrator, which clusters clients on them.

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{AiError, DescriptorError, ModelError};
use crate::model::Model;
use crate::style::{style_fallback_dim, StyleExtractor};
use crate::tensor::Tensor;
use crate::transforms::grayscale_tensor;

/// Parameters of a descriptor computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorOptions {
    /// Embedding width produced by the encoder
    pub output_dim: usize,
    /// Use style statistics instead of the encoder
    pub style_extraction: bool,
    /// Flattened length of one sample, sizes the style fallback
    pub sample_flat_dim: usize,
    /// Number of classes (buckets)
    pub n_classes: usize,
    /// Convert 3-channel samples to luminance first
    pub grayscale: bool,
}

impl DescriptorOptions {
    /// Encoder-based options
    pub fn new(output_dim: usize, sample_flat_dim: usize, n_classes: usize) -> Self {
        Self {
            output_dim,
            style_extraction: false,
            sample_flat_dim,
            n_classes,
            grayscale: false,
        }
    }

    /// Switches to style extraction
    pub fn with_style_extraction(mut self, enabled: bool) -> Self {
        self.style_extraction = enabled;
        self
    }

    /// Enables grayscale pre-conversion
    pub fn with_grayscale(mut self, enabled: bool) -> Self {
        self.grayscale = enabled;
        self
    }

    /// Length of one class descriptor
    pub fn descriptor_dim(&self) -> Result<usize, DescriptorError> {
        if self.style_extraction {
            style_fallback_dim(self.sample_flat_dim)
        } else {
            Ok(self.output_dim)
        }
    }
}

/// Splits samples into `n_classes` buckets in a single pass, keeping order
pub fn split_by_class(
    samples: impl IntoIterator<Item = (Tensor, usize)>,
    n_classes: usize,
) -> Result<Vec<Vec<Tensor>>, DescriptorError> {
    let mut buckets: Vec<Vec<Tensor>> = (0..n_classes).map(|_| Vec::new()).collect();
    for (sample, label) in samples {
        let bucket = buckets
            .get_mut(label)
            .ok_or(DescriptorError::LabelOutOfRange { label, n_classes })?;
        bucket.push(sample);
    }
    Ok(buckets)
}

fn encoder_descriptor(
    encoder: &mut dyn Model,
    bucket: &[Tensor],
    output_dim: usize,
) -> Result<Vec<f32>, ModelError> {
    let batch = Tensor::stack(bucket)?;
    let embeddings = encoder.forward(&batch)?;
    let expected = vec![bucket.len(), output_dim];
    if embeddings.shape().dims() != expected.as_slice() {
        return Err(ModelError::ShapeMismatch {
            layer: encoder.name().to_string(),
            expected,
            actual: embeddings.shape().dims().to_vec(),
        });
    }
    Ok(embeddings.mean_rows()?.into_data())
}

fn style_descriptor(
    extractor: &dyn StyleExtractor,
    bucket: &[Tensor],
) -> Result<Vec<f32>, DescriptorError> {
    let mut sum: Vec<f32> = Vec::new();
    for sample in bucket {
        let style = extractor.extract(sample)?;
        if sum.is_empty() {
            sum = style;
            continue;
        }
        if style.len() != sum.len() {
            return Err(DescriptorError::InvalidSample {
                reason: format!(
                    "style vector of length {} differs from {}",
                    style.len(),
                    sum.len()
                ),
            });
        }
        sum.iter_mut().zip(&style).for_each(|(acc, v)| *acc += v);
    }
    let n = bucket.len() as f32;
    Ok(sum.into_iter().map(|v| v / n).collect())
}

/// Computes the concatenated per-class descriptors of a local partition.
///
/// An empty class bucket is replaced by a uniform random vector of the
/// descriptor dimension; this keeps the output length fixed at
/// `n_classes * descriptor_dim` at the cost of injecting noise.
pub fn compute_descriptors<R: Rng + ?Sized>(
    encoder: &mut dyn Model,
    samples: impl IntoIterator<Item = (Tensor, usize)>,
    options: &DescriptorOptions,
    style: &dyn StyleExtractor,
    rng: &mut R,
) -> Result<Vec<f32>, AiError> {
    let samples = samples.into_iter().map(|(sample, label)| {
        if options.grayscale {
            grayscale_tensor(&sample).map(|gray| (gray, label))
        } else {
            Ok((sample, label))
        }
    });
    let samples = samples.collect::<Result<Vec<_>, _>>()?;
    let buckets = split_by_class(samples, options.n_classes)?;

    let mut descriptors = Vec::new();
    for (class, bucket) in buckets.iter().enumerate() {
        let descriptor = if bucket.is_empty() {
            let dim = options.descriptor_dim()?;
            warn!(
                "Class {} has no local samples, using a random {}-dim descriptor",
                class, dim
            );
            Tensor::random_uniform(dim, rng).into_data()
        } else if options.style_extraction {
            style_descriptor(style, bucket)?
        } else {
            encoder_descriptor(encoder, bucket, options.output_dim)?
        };
        debug!(
            "Class {}: {} samples -> {} values",
            class,
            bucket.len(),
            descriptor.len()
        );
        descriptors.extend(descriptor);
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearModel;
    use crate::style::GridStyleExtractor;
    use crate::tensor::TensorShape;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn encoder(rng: &mut StdRng) -> LinearModel {
        LinearModel::random(4, 2, rng).with_name("encoder")
    }

    fn sample(values: [f32; 4]) -> Tensor {
        Tensor::new(values.to_vec(), TensorShape::d3(1, 2, 2)).unwrap()
    }

    #[test]
    fn test_split_by_class_preserves_order() {
        let samples = vec![
            (Tensor::from_vec(vec![1.0]), 1),
            (Tensor::from_vec(vec![2.0]), 0),
            (Tensor::from_vec(vec![3.0]), 1),
        ];
        let buckets = split_by_class(samples, 3).unwrap();
        assert_eq!(buckets[0].len(), 1);
        assert_eq!(buckets[1][0].data(), &[1.0]);
        assert_eq!(buckets[1][1].data(), &[3.0]);
        assert!(buckets[2].is_empty());
    }

    #[test]
    fn test_label_out_of_range() {
        let samples = vec![(Tensor::from_vec(vec![1.0]), 5)];
        assert_eq!(
            split_by_class(samples, 3).unwrap_err(),
            DescriptorError::LabelOutOfRange {
                label: 5,
                n_classes: 3
            }
        );
    }

    #[test]
    fn test_single_sample_descriptor_equals_embedding() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = encoder(&mut rng);
        let a = sample([0.1, 0.2, 0.3, 0.4]);
        let b = sample([1.0, 0.0, 1.0, 0.0]);
        let emb_a = model.forward(&Tensor::stack(&[a.clone()]).unwrap()).unwrap();
        let emb_b = model.forward(&Tensor::stack(&[b.clone()]).unwrap()).unwrap();

        let options = DescriptorOptions::new(2, 4, 2);
        let desc = compute_descriptors(
            &mut model,
            vec![(b, 1), (a, 0)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        assert_eq!(&desc[..2], emb_a.data());
        assert_eq!(&desc[2..], emb_b.data());
    }

    #[test]
    fn test_descriptor_is_mean_embedding() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = encoder(&mut rng);
        let a = sample([0.0, 0.0, 0.0, 0.0]);
        let b = sample([1.0, 1.0, 1.0, 1.0]);
        let batch = Tensor::stack(&[a.clone(), b.clone()]).unwrap();
        let expected = model.forward(&batch).unwrap().mean_rows().unwrap();

        let options = DescriptorOptions::new(2, 4, 1);
        let desc = compute_descriptors(
            &mut model,
            vec![(a, 0), (b, 0)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        assert_eq!(desc, expected.into_data());
    }

    #[test]
    fn test_empty_bucket_fallback_dimension() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = encoder(&mut rng);
        let options = DescriptorOptions::new(2, 4, 3);
        let desc = compute_descriptors(
            &mut model,
            vec![(sample([0.5; 4]), 1)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        assert_eq!(desc.len(), 6);
        assert!(desc[..2].iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_style_descriptors() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut model = encoder(&mut rng);
        let options = DescriptorOptions::new(2, 784, 2).with_style_extraction(true);
        let image = Tensor::new(vec![0.5; 784], TensorShape::d3(1, 28, 28)).unwrap();
        let desc = compute_descriptors(
            &mut model,
            vec![(image, 0)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        assert_eq!(desc.len(), 50);
        assert!(desc[..25].iter().all(|&v| (v - 0.5).abs() < 1e-6));

        let rgb = DescriptorOptions::new(2, 3072, 10).with_style_extraction(true);
        let desc = compute_descriptors(
            &mut model,
            Vec::new(),
            &rgb,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        assert_eq!(desc.len(), 1470);
    }

    #[test]
    fn test_unsupported_style_dimension() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut model = encoder(&mut rng);
        let options = DescriptorOptions::new(2, 1024, 2).with_style_extraction(true);
        let err = compute_descriptors(
            &mut model,
            Vec::new(),
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AiError::Descriptor(DescriptorError::UnsupportedDescriptorDimension {
                sample_flat_dim: 1024
            })
        ));
    }

    #[test]
    fn test_encoder_width_mismatch() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut model = encoder(&mut rng);
        let options = DescriptorOptions::new(3, 4, 1);
        let err = compute_descriptors(
            &mut model,
            vec![(sample([0.0; 4]), 0)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, AiError::Model(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_grayscale_before_encoding() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut model = encoder(&mut rng);
        let rgb = Tensor::new(vec![1.0; 12], TensorShape::d3(3, 2, 2)).unwrap();
        let options = DescriptorOptions::new(2, 4, 1).with_grayscale(true);
        let desc = compute_descriptors(
            &mut model,
            vec![(rgb.clone(), 0)],
            &options,
            &GridStyleExtractor,
            &mut rng,
        )
        .unwrap();
        let gray = grayscale_tensor(&rgb).unwrap();
        let expected = model.forward(&Tensor::stack(&[gray]).unwrap()).unwrap();
        assert_eq!(desc, expected.into_data());
    }
}
