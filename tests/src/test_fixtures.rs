//! Test fixtures and client builders
//!
//! Partitions are filled with class-pattern images: class `c` lights a
//! vertical band of columns, so per-class descriptors differ by class and
//! transforms such as `invert` or `rotate90` shift them in a recognisable way.

use fedclust_ai::{GridStyleExtractor, Image, LinearModel};
use fedclust_common::{ClientArgs, ModelKind};
use fedclust_fl::{ClientCore, DataSource, FlClient, ImageDataset, InMemoryPartitions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mock_trainer::MockTrainer;

/// Geometry and sizes of the synthetic partitions
#[derive(Debug, Clone)]
pub struct TestDataConfig {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub n_classes: usize,
    pub train_samples: usize,
    pub val_samples: usize,
    /// Upper bound of the uniform pixel noise
    pub noise: u8,
}

impl Default for TestDataConfig {
    fn default() -> Self {
        Self {
            width: 8,
            height: 8,
            channels: 1,
            n_classes: 4,
            train_samples: 16,
            val_samples: 8,
            noise: 0,
        }
    }
}

impl TestDataConfig {
    /// Sets the image geometry
    pub fn with_image(mut self, width: usize, height: usize, channels: usize) -> Self {
        self.width = width;
        self.height = height;
        self.channels = channels;
        self
    }

    pub fn with_noise(mut self, noise: u8) -> Self {
        self.noise = noise;
        self
    }

    pub fn flat_dim(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Client arguments matching this data
    pub fn client_args(&self, z_dim: usize) -> ClientArgs {
        ClientArgs::new(ModelKind::Cnn)
            .with_n_classes(self.n_classes)
            .with_z_dim(z_dim)
    }

    fn image(&self, label: usize, rng: &mut StdRng) -> Image {
        let (width, n_classes, noise) = (self.width, self.n_classes, self.noise);
        Image::from_fn(self.width, self.height, self.channels, |x, _, _| {
            let base = if x * n_classes / width == label { 200 } else { 20 };
            let jitter = if noise == 0 { 0 } else { rng.gen_range(0..noise) };
            base + jitter.min(50)
        })
        .expect("1 or 3 channels")
    }

    /// Samples with labels `0, 1, .., n_classes - 1, 0, ..`
    pub fn dataset(&self, len: usize, rng: &mut StdRng) -> ImageDataset {
        (0..len)
            .map(|i| {
                let label = i % self.n_classes;
                (self.image(label, rng), label)
            })
            .collect()
    }
}

/// `n` partitions of the same distribution
pub fn pattern_partitions(config: &TestDataConfig, n: usize, seed: u64) -> InMemoryPartitions {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut partitions = InMemoryPartitions::new(seed);
    for _ in 0..n {
        let train = config.dataset(config.train_samples, &mut rng);
        let val = config.dataset(config.val_samples, &mut rng);
        partitions.push(train, val);
    }
    partitions
}

/// Encoding client with a shared random-projection encoder
pub fn encoding_client(
    config: &TestDataConfig,
    args: ClientArgs,
    partitions: InMemoryPartitions,
    encoder_seed: u64,
) -> FlClient {
    let mut rng = StdRng::seed_from_u64(encoder_seed);
    let encoder = LinearModel::random(config.flat_dim(), args.z_dim, &mut rng).with_name("encoder");
    let core = ClientCore::new(
        args,
        Box::new(LinearModel::new(config.flat_dim(), config.n_classes)),
        Box::new(MockTrainer::new()),
        DataSource::Simulated(Box::new(partitions)),
    )
    .expect("valid client args");
    FlClient::encoding(core, Box::new(encoder), Box::new(GridStyleExtractor))
}
