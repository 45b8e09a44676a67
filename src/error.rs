//! Error types for the biogeography engine.
//!
//! Numerical degeneracy (a zero likelihood, a node with no admissible range)
//! is not an error and is returned as a value.

use thiserror::Error;

/// Main error type for range-model and engine operations.
#[derive(Error, Debug)]
pub enum BioGeoError {
    /// Malformed caller data (shape mismatches, out-of-range indices)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A range that is not part of the state-space index
    #[error("Unknown range: {0}")]
    UnknownRange(String),

    /// A node lookup by name or index that failed
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// An area name that is not in the area list
    #[error("Unknown area: {0}")]
    UnknownArea(String),

    /// Newick reader errors
    #[error("Tree parse error at position {position}: {message}")]
    TreeParse { position: usize, message: String },

    /// Configurations the engine refuses to approximate
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// Linear algebra failures (singular systems, non-finite matrix entries)
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results using BioGeoError
pub type Result<T> = std::result::Result<T, BioGeoError>;

impl BioGeoError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a tree parse error
    pub fn tree_parse(position: usize, message: impl Into<String>) -> Self {
        Self::TreeParse {
            position,
            message: message.into(),
        }
    }
}
