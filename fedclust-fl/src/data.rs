//! Local data plumbing
//!
//! Clients never see datasets directly; they get a pair of [`DataLoader`]s
//! (train and validation) from a [`PartitionLoader`] and hand them to a
//! [`LocalTrainer`]. Loaders apply the round's [`TransformPair`] on every
//! pass, so random transforms are redrawn each epoch.

use std::sync::Arc;

use fedclust_ai::{Image, Model, ModelError, Tensor, TransformPair};
use fedclust_common::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::ClientError;

/// A stacked batch of transformed samples
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[n, ...]` inputs
    pub inputs: Tensor,
    /// Labels, one per input row
    pub labels: Vec<usize>,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Iterable view of one side of a partition
pub trait DataLoader: Send {
    /// Number of samples in one pass
    fn num_samples(&self) -> usize;

    /// Samples per batch
    fn batch_size(&self) -> usize;

    /// One pass over the transformed `(sample, label)` pairs
    fn samples(&mut self) -> Vec<(Tensor, usize)>;

    /// One pass grouped into stacked batches
    fn batches(&mut self) -> Result<Vec<Batch>, ModelError> {
        let batch_size = self.batch_size().max(1);
        let samples = self.samples();
        let mut batches = Vec::with_capacity((samples.len() + batch_size - 1) / batch_size);
        for chunk in samples.chunks(batch_size) {
            let tensors: Vec<Tensor> = chunk.iter().map(|(t, _)| t.clone()).collect();
            batches.push(Batch {
                inputs: Tensor::stack(&tensors)?,
                labels: chunk.iter().map(|(_, l)| *l).collect(),
            });
        }
        Ok(batches)
    }

    /// Flattened length of one sample, 0 when the loader is empty
    fn sample_flat_dim(&mut self) -> usize {
        self.samples().first().map(|(t, _)| t.len()).unwrap_or(0)
    }
}

/// Labelled images held in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDataset {
    images: Vec<Image>,
    labels: Vec<usize>,
}

impl ImageDataset {
    /// Creates an empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one labelled image
    pub fn push(&mut self, image: Image, label: usize) {
        self.images.push(image);
        self.labels.push(label);
    }

    /// Number of images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Ground-truth labels
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Iterates over `(image, label)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&Image, usize)> {
        self.images.iter().zip(self.labels.iter().copied())
    }
}

impl FromIterator<(Image, usize)> for ImageDataset {
    fn from_iter<I: IntoIterator<Item = (Image, usize)>>(iter: I) -> Self {
        let mut dataset = Self::new();
        for (image, label) in iter {
            dataset.push(image, label);
        }
        dataset
    }
}

/// Loader over an in-memory dataset
pub struct InMemoryLoader {
    dataset: Arc<ImageDataset>,
    transform: TransformPair,
    batch_size: usize,
    rng: StdRng,
}

impl InMemoryLoader {
    /// Creates a loader applying `transform` with a seeded RNG
    pub fn new(
        dataset: Arc<ImageDataset>,
        transform: TransformPair,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            transform,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Transform applied on every pass
    pub fn transform(&self) -> &TransformPair {
        &self.transform
    }
}

impl DataLoader for InMemoryLoader {
    fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn samples(&mut self) -> Vec<(Tensor, usize)> {
        let rng = &mut self.rng;
        let transform = &self.transform;
        self.dataset
            .iter()
            .map(|(image, label)| transform.apply(image, label, &mut *rng))
            .collect()
    }
}

/// Train and validation loaders for one partition
pub type LoaderPair = (Box<dyn DataLoader>, Box<dyn DataLoader>);

/// Loads a numbered data shard with a given transform
pub trait PartitionLoader: Send {
    /// Builds train and validation loaders for `partition`
    fn load_partition(
        &mut self,
        partition: u64,
        batch_size: usize,
        transform: &TransformPair,
    ) -> Result<LoaderPair, ClientError>;
}

/// Partitions held in memory, indexed by partition number
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartitions {
    partitions: Vec<(Arc<ImageDataset>, Arc<ImageDataset>)>,
    seed: u64,
}

impl InMemoryPartitions {
    /// Creates an empty partition set; loaders derive their seeds from `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            partitions: Vec::new(),
            seed,
        }
    }

    /// Appends a partition; returns its number
    pub fn push(&mut self, train: ImageDataset, val: ImageDataset) -> u64 {
        self.partitions.push((Arc::new(train), Arc::new(val)));
        (self.partitions.len() - 1) as u64
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// True if no partitions were added
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl PartitionLoader for InMemoryPartitions {
    fn load_partition(
        &mut self,
        partition: u64,
        batch_size: usize,
        transform: &TransformPair,
    ) -> Result<LoaderPair, ClientError> {
        let (train, val) = usize::try_from(partition)
            .ok()
            .and_then(|i| self.partitions.get(i))
            .ok_or_else(|| ClientError::NoData {
                reason: format!(
                    "partition {partition} not found ({} available)",
                    self.partitions.len()
                ),
            })?;
        debug!(
            "Loading partition {} ({} train, {} val) with transform {:?}",
            partition,
            train.len(),
            val.len(),
            transform.instruction
        );
        let seed = self.seed.wrapping_add(partition.wrapping_mul(2));
        Ok((
            Box::new(InMemoryLoader::new(
                Arc::clone(train),
                transform.clone(),
                batch_size,
                seed,
            )),
            Box::new(InMemoryLoader::new(
                Arc::clone(val),
                transform.clone(),
                batch_size,
                seed.wrapping_add(1),
            )),
        ))
    }
}

/// Options forwarded to a training pass
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    /// Local epochs
    pub epochs: u32,
    /// Learning rate, trainer default when `None`
    pub learning_rate: Option<f32>,
    /// Device to train on
    pub device: Device,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: None,
            device: Device::default(),
        }
    }
}

/// Loss and accuracy of a validation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    /// Mean loss
    pub loss: f32,
    /// Accuracy in `[0, 1]`
    pub accuracy: f32,
}

/// Local optimization and evaluation routines
pub trait LocalTrainer: Send {
    /// Trains a classifier in place
    fn train_classifier(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        options: &TrainOptions,
    ) -> Result<(), ClientError>;

    /// Trains a regression model in place
    fn train_regression(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        options: &TrainOptions,
    ) -> Result<(), ClientError>;

    /// Evaluates a classifier
    fn test_classifier(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        device: &Device,
    ) -> Result<EvalOutcome, ClientError>;

    /// Evaluates a regression model
    fn test_regression(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        device: &Device,
    ) -> Result<EvalOutcome, ClientError>;
}
