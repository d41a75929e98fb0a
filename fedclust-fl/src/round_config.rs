//! Per-round configuration and returned metadata
//!
//! The orchestrator sends a [`RoundConfig`] with every `fit` / `evaluate`
//! call and gets a [`Metadata`] map back. Both sides only agree on a small
//! scalar vocabulary, modelled by [`Scalar`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Task value that turns an Encoding client's `fit` into a descriptor round
pub const TASK_COMPUTE_LOW_DIM: &str = "compute_low_dim";

/// Options sent by the orchestrator for one round. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Corruption/augmentation instruction for the partition
    pub transform: Option<String>,
    /// Data shard to load
    pub partition: Option<u64>,
    /// Current round index, starting at 1
    pub round: Option<u64>,
    /// Number of personalization blocks
    pub n_clusters: Option<usize>,
    /// Number of shared leading layers
    pub n_base_layers: Option<usize>,
    /// Number of layers per personalization block
    pub n_pers_layers: Option<usize>,
    /// Client index as seen by the orchestrator
    pub client_number: Option<u64>,
    /// Cluster the orchestrator placed this client in
    pub cluster_id: Option<u64>,
    /// Round task, e.g. [`TASK_COMPUTE_LOW_DIM`]
    pub task: Option<String>,
    /// Local epochs forwarded to the trainer
    pub local_epochs: Option<u32>,
    /// Learning rate forwarded to the trainer
    pub learning_rate: Option<f32>,
    /// Descriptor computation time echoed back for ratio logging
    pub t_comp: Option<f64>,
}

fn require<T: Clone>(value: &Option<T>, key: &'static str) -> Result<T, ClientError> {
    value.clone().ok_or(ClientError::MissingConfig { key })
}

impl RoundConfig {
    /// Creates an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transform instruction
    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    /// Sets the partition
    pub fn with_partition(mut self, partition: u64) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Sets the round index
    pub fn with_round(mut self, round: u64) -> Self {
        self.round = Some(round);
        self
    }

    /// Sets the parameter layout used by IFCA
    pub fn with_layout(mut self, n_clusters: usize, n_base_layers: usize, n_pers_layers: usize) -> Self {
        self.n_clusters = Some(n_clusters);
        self.n_base_layers = Some(n_base_layers);
        self.n_pers_layers = Some(n_pers_layers);
        self
    }

    /// Sets the client number
    pub fn with_client_number(mut self, client_number: u64) -> Self {
        self.client_number = Some(client_number);
        self
    }

    /// Sets the cluster id
    pub fn with_cluster_id(mut self, cluster_id: u64) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Sets the task
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Sets the echoed descriptor time
    pub fn with_t_comp(mut self, t_comp: f64) -> Self {
        self.t_comp = Some(t_comp);
        self
    }

    /// True for descriptor rounds
    pub fn is_descriptor_round(&self) -> bool {
        self.task.as_deref() == Some(TASK_COMPUTE_LOW_DIM)
    }

    /// Transform instruction, required in simulation mode
    pub fn require_transform(&self) -> Result<String, ClientError> {
        require(&self.transform, "transform")
    }

    /// Partition, required in simulation mode
    pub fn require_partition(&self) -> Result<u64, ClientError> {
        require(&self.partition, "partition")
    }

    /// Round index, required by IFCA
    pub fn require_round(&self) -> Result<u64, ClientError> {
        require(&self.round, "round")
    }

    /// `(n_clusters, n_base_layers, n_pers_layers)`, required by IFCA
    pub fn require_layout(&self) -> Result<(usize, usize, usize), ClientError> {
        Ok((
            require(&self.n_clusters, "n_clusters")?,
            require(&self.n_base_layers, "n_base_layers")?,
            require(&self.n_pers_layers, "n_pers_layers")?,
        ))
    }

    /// Client number, echoed by Encoding and IFCA
    pub fn require_client_number(&self) -> Result<u64, ClientError> {
        require(&self.client_number, "client_number")
    }
}

/// A scalar value in returned metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// String
    Str(String),
}

impl Scalar {
    /// Numeric value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, if any
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        Scalar::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f32> for Scalar {
    fn from(v: f32) -> Self {
        Scalar::Float(f64::from(v))
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

/// Metadata returned by `fit` / `evaluate`
pub type Metadata = BTreeMap<String, Scalar>;
