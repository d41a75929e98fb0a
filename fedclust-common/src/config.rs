//! Configuration structures for clients and simulations
//!
//! This module provides the static configuration a client is constructed
//! with ([`ClientArgs`]) and the plan the simulation driver runs
//! ([`SimulationConfig`]). Both round-trip through YAML.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind of local model a client trains.
///
/// The dispatch is exhaustive: strings other than `cnn` and `regression` are
/// rejected with [`Error::UnsupportedModelType`] while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelKind {
    /// Convolutional classifier trained with a classification loss
    Cnn,
    /// Regression model
    Regression,
}

impl ModelKind {
    /// Returns the configuration string for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Cnn => "cnn",
            ModelKind::Regression => "regression",
        }
    }
}

impl TryFrom<String> for ModelKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKind> for String {
    fn from(kind: ModelKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::str::FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cnn" => Ok(ModelKind::Cnn),
            "regression" => Ok(ModelKind::Regression),
            other => Err(Error::UnsupportedModelType(other.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dataset the local partitions are drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    /// 28x28 grayscale digits
    #[default]
    Mnist,
    /// 28x28 grayscale clothing items
    FashionMnist,
    /// 32x32 RGB images
    Cifar10,
}

/// Compression scheme used for the descriptor network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    /// Autoencoder trained on grayscale inputs
    #[serde(rename = "AE", alias = "ae")]
    Autoencoder,
    /// Any other encoder operating on the raw samples
    #[default]
    #[serde(rename = "none")]
    None,
}

/// Compute device placement.
///
/// Resolved once at startup and handed to every client constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Host CPU (default, always available)
    #[default]
    Cpu,
    /// CUDA accelerator
    Cuda {
        /// CUDA device ID (0 for first GPU)
        device_id: u32,
    },
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

fn default_z_dim() -> usize {
    2
}

fn default_n_classes() -> usize {
    10
}

fn default_batch_size() -> usize {
    64
}

/// Static per-client arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientArgs {
    /// Local model kind
    pub model: ModelKind,
    /// Dataset the partitions come from
    #[serde(default)]
    pub dataset: Dataset,
    /// Descriptor network compression scheme
    #[serde(default)]
    pub compression: Compression,
    /// Width of the encoder embedding used for descriptors
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,
    /// Use statistical style extraction instead of the encoder
    #[serde(default)]
    pub style_extraction: bool,
    /// Number of label classes
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,
    /// Local batch size
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seed for the client's random number generator
    #[serde(default)]
    pub seed: u64,
    /// Compute device
    #[serde(default)]
    pub device: Device,
    /// Fixed transform instruction (used outside simulation mode)
    #[serde(default)]
    pub transform: Option<String>,
}

impl ClientArgs {
    /// Creates arguments with defaults for everything but the model kind
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            dataset: Dataset::default(),
            compression: Compression::default(),
            z_dim: default_z_dim(),
            style_extraction: false,
            n_classes: default_n_classes(),
            batch_size: default_batch_size(),
            seed: 0,
            device: Device::default(),
            transform: None,
        }
    }

    /// Sets the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the embedding width
    pub fn with_z_dim(mut self, z_dim: usize) -> Self {
        self.z_dim = z_dim;
        self
    }

    /// Sets the number of classes
    pub fn with_n_classes(mut self, n_classes: usize) -> Self {
        self.n_classes = n_classes;
        self
    }

    /// Enables or disables style extraction
    pub fn with_style_extraction(mut self, enabled: bool) -> Self {
        self.style_extraction = enabled;
        self
    }

    /// Whether descriptor samples are converted to grayscale first.
    ///
    /// The autoencoder for CIFAR-10 is trained on single-channel inputs.
    pub fn grayscale_descriptors(&self) -> bool {
        self.compression == Compression::Autoencoder && self.dataset == Dataset::Cifar10
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.n_classes == 0 {
            return Err(Error::Config("n_classes must be at least 1".to_string()));
        }
        if self.z_dim == 0 {
            return Err(Error::Config("z_dim must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Parses client arguments from a YAML string.
    ///
    /// # Example
    /// ```
    /// use fedclust_common::{ClientArgs, ModelKind};
    ///
    /// let args = ClientArgs::from_yaml("model: cnn\nz_dim: 4\n").unwrap();
    /// assert_eq!(args.model, ModelKind::Cnn);
    /// assert_eq!(args.batch_size, 64);
    /// ```
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let args: Self = serde_yaml::from_str(yaml)?;
        args.validate()?;
        Ok(args)
    }
}

/// Geometry of the synthetic images a simulation generates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
    /// Number of channels (1 or 3)
    pub channels: usize,
}

impl ImageSpec {
    /// Number of values in one flattened sample
    pub fn flat_dim(&self) -> usize {
        self.width * self.height * self.channels
    }
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            width: 28,
            height: 28,
            channels: 1,
        }
    }
}

/// A group of clients sharing one transform instruction.
///
/// Groups are the ground truth the clustering is scored against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Transform instruction applied to every client of the group
    pub transform: String,
    /// Number of clients in the group
    pub clients: usize,
}

fn default_rounds() -> u64 {
    1
}

fn default_samples_per_client() -> usize {
    200
}

/// Plan for a descriptor-clustering simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of k-means clusters
    pub n_clusters: usize,
    /// Number of descriptor rounds (the k-means model is carried across them)
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    /// Also report the silhouette-optimal number of clusters
    #[serde(default)]
    pub find_optimal: bool,
    /// Local samples generated per client
    #[serde(default = "default_samples_per_client")]
    pub samples_per_client: usize,
    /// Synthetic image geometry
    #[serde(default)]
    pub image: ImageSpec,
    /// Client groups
    pub groups: Vec<GroupSpec>,
    /// Arguments shared by every client
    pub client: ClientArgs,
}

impl SimulationConfig {
    /// Total number of simulated clients
    pub fn n_clients(&self) -> usize {
        self.groups.iter().map(|g| g.clients).sum()
    }

    /// Ground-truth transform per client index, in client order
    pub fn cluster_truth(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| std::iter::repeat(g.transform.clone()).take(g.clients))
            .collect()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), Error> {
        self.client.validate()?;
        if self.n_clusters == 0 {
            return Err(Error::Config("n_clusters must be at least 1".to_string()));
        }
        if self.rounds == 0 {
            return Err(Error::Config("rounds must be at least 1".to_string()));
        }
        if self.groups.is_empty() {
            return Err(Error::Config("at least one client group is required".to_string()));
        }
        let n_clients = self.n_clients();
        if n_clients < self.n_clusters {
            return Err(Error::Config(format!(
                "{n_clients} clients cannot form {} clusters",
                self.n_clusters
            )));
        }
        if !matches!(self.image.channels, 1 | 3) {
            return Err(Error::Config(format!(
                "unsupported channel count {}",
                self.image.channels
            )));
        }
        Ok(())
    }

    /// Parses a simulation plan from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a simulation plan from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}
