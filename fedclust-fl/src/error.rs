//! Error types for federated clients and clustering

use fedclust_ai::{AiError, DescriptorError, ModelError};
use thiserror::Error;

/// Errors returned from a client's `fit` / `evaluate` exchange
#[derive(Error, Debug)]
pub enum ClientError {
    /// Parameter exchange or forward pass failed
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Descriptor extraction failed
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Configuration rejected while building the client
    #[error("Configuration error: {0}")]
    Config(#[from] fedclust_common::Error),

    /// A round option needed by this operation was not sent
    #[error("Missing round config key: {key}")]
    MissingConfig {
        /// Name of the missing key
        key: &'static str,
    },

    /// No partition has been loaded yet
    #[error("No local data loaded: {reason}")]
    NoData {
        /// What was requested
        reason: String,
    },

    /// The local trainer reported a failure
    #[error("Training failed: {0}")]
    Training(String),
}

impl From<AiError> for ClientError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::Model(e) => ClientError::Model(e),
            AiError::Descriptor(e) => ClientError::Descriptor(e),
        }
    }
}

/// Errors from clustering and clustering scores
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusteringError {
    /// No samples were given
    #[error("Clustering input is empty")]
    EmptyInput,

    /// Cluster count is zero or exceeds the number of samples
    #[error("Invalid cluster count {n_clusters} for {n_samples} samples")]
    InvalidClusterCount {
        /// Requested clusters
        n_clusters: usize,
        /// Available samples
        n_samples: usize,
    },

    /// Sample rows of different lengths
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected row length
        expected: usize,
        /// Actual row length
        actual: usize,
    },

    /// Two label vectors of different lengths
    #[error("Label count mismatch: {left} vs {right}")]
    LabelCountMismatch {
        /// First vector length
        left: usize,
        /// Second vector length
        right: usize,
    },

    /// Silhouette needs between 2 and n_samples - 1 distinct labels
    #[error("Silhouette needs 2..={max} labels, got {n_labels}")]
    TooFewLabels {
        /// Distinct labels found
        n_labels: usize,
        /// Largest valid label count
        max: usize,
    },
}
