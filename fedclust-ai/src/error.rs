//! Error types for tensor, model and descriptor operations
//!
//! This module defines the error hierarchy for parameter exchange with a
//! local model and for per-class descriptor extraction.

use thiserror::Error;

/// Top-level error type for AI operations
#[derive(Error, Debug)]
pub enum AiError {
    /// Model-related errors
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Descriptor extraction errors
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// Errors that occur while moving parameters in and out of a model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// A tensor does not have the shape the receiving layer expects
    #[error("Shape mismatch for {layer}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Layer (or tensor) name
        layer: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape provided
        actual: Vec<usize>,
    },

    /// Number of tensors differs from the number of model layers
    #[error("Parameter count mismatch: expected {expected}, got {actual}")]
    ParameterCount {
        /// Number of layers in the model
        expected: usize,
        /// Number of tensors received
        actual: usize,
    },

    /// Layer names or their order differ from the model's own state
    #[error("Unexpected layer at position {position}: expected {expected}, got {actual}")]
    LayerOrder {
        /// Position in the ordered state
        position: usize,
        /// Layer name the model expects
        expected: String,
        /// Layer name provided
        actual: String,
    },

    /// Base/personalization partition does not fit the parameter vector
    #[error("Invalid parameter split: {reason}")]
    InvalidSplit {
        /// Why the split is invalid
        reason: String,
    },

    /// Data length does not agree with the declared shape
    #[error("Invalid tensor: {reason}")]
    InvalidTensor {
        /// Why the tensor is invalid
        reason: String,
    },
}

/// Errors that occur during per-class descriptor extraction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    /// No fallback style dimension is known for this flattened sample size
    #[error("Unsupported descriptor dimension for flattened sample size {sample_flat_dim}")]
    UnsupportedDescriptorDimension {
        /// Flattened sample length
        sample_flat_dim: usize,
    },

    /// A sample carries a label outside `0..n_classes`
    #[error("Label {label} out of range for {n_classes} classes")]
    LabelOutOfRange {
        /// Offending label
        label: usize,
        /// Configured number of classes
        n_classes: usize,
    },

    /// A sample cannot be interpreted as an image tensor
    #[error("Invalid sample: {reason}")]
    InvalidSample {
        /// Why the sample is invalid
        reason: String,
    },
}
