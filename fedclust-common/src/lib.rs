//! Common types and utilities for fedclust
//!
//! This crate provides the configuration structures, error type and logging
//! setup shared across all fedclust crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    ClientArgs, Compression, Dataset, Device, GroupSpec, ImageSpec, ModelKind, SimulationConfig,
};
pub use error::Error;
pub use logging::{format_seconds, init_logging, init_logging_with_filter, LogLevel};
