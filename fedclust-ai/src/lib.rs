//! Model, tensor and descriptor infrastructure for fedclust
//!
//! This crate holds everything a federated client needs to reason about its
//! local model and data without knowing anything about the orchestrator:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          fedclust-ai                             │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐  │
//! │  │  Model         │  │  Transforms      │  │  Descriptors     │  │
//! │  │  - StateDict   │  │  - ImageOp       │  │  - split_by_class│  │
//! │  │  - ParamVector │  │  - LabelFlip     │  │  - encoder mean  │  │
//! │  │  - ParamSplit  │  │  - Selector      │  │  - style mean    │  │
//! │  └────────────────┘  └──────────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use fedclust_ai::{compute_descriptors, DescriptorOptions, GridStyleExtractor, LinearModel};
//!
//! let mut encoder = LinearModel::random(784, 2, &mut rng);
//! let options = DescriptorOptions::new(2, 784, 10);
//! let descriptors =
//!     compute_descriptors(&mut encoder, samples, &options, &GridStyleExtractor, &mut rng)?;
//! assert_eq!(descriptors.len(), 20);
//! ```

pub mod descriptor;
pub mod error;
pub mod model;
pub mod style;
pub mod tensor;
pub mod transforms;

// Re-export main types
pub use descriptor::{compute_descriptors, split_by_class, DescriptorOptions};
pub use error::{AiError, DescriptorError, ModelError};
pub use model::{LinearModel, Model, ParameterSplit, ParameterVector, StateDict};
pub use style::{style_fallback_dim, GridStyleExtractor, StyleExtractor};
pub use tensor::{Tensor, TensorShape};
pub use transforms::{
    grayscale_tensor, select, Image, ImageOp, LabelFlip, SampleTransform, TransformPair,
    TransformSelector,
};
