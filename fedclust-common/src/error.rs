//! Error types for fedclust

use thiserror::Error;

/// Error types for the fedclust configuration layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model-type dispatch value that no client knows how to train.
    #[error("Unsupported model type: {0} (expected \"cnn\" or \"regression\")")]
    UnsupportedModelType(String),

    /// File I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}
