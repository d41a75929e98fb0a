//! Integration test framework for fedclust
#![allow(missing_docs)]
//!
//! Test utilities and mock components for exercising the client protocols
//! together with the orchestrator-side clustering.
//!
//! # Components
//!
//! - [`mock_trainer`] - Deterministic trainer with a configurable loss
//! - [`test_fixtures`] - Synthetic partitions and client builders
//! - [`test_utils`] - Logging setup and float assertions
//!
//! # Test Categories
//!
//! 1. **Client Protocol Tests** - Standard, Encoding and IFCA rounds
//! 2. **Clustering Tests** - Descriptors from clients through k-means and ARI

pub mod client_integration;
pub mod clustering_integration;
pub mod mock_trainer;
pub mod test_fixtures;
pub mod test_utils;

pub use mock_trainer::{MockTrainer, TrainerStats};
pub use test_fixtures::{encoding_client, pattern_partitions, TestDataConfig};
pub use test_utils::{assert_close, init_test_logging, TestResult};
