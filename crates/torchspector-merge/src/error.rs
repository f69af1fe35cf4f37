//! Error types for ratio merging.

use std::path::PathBuf;

use thiserror::Error;
use torchspector_core::{CheckpointError, ValueKind};

/// Errors that can occur during a ratio merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Checkpoint loading or codec error.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Checkpoint could not be resolved by the loader.
    #[error("Failed to load checkpoint: {0}")]
    ModelLoad(String),

    /// Shape mismatch between an incoming tensor and the accumulated sum.
    #[error(
        "Shape mismatch for '{key}' in root '{root}': accumulated {expected:?}, {checkpoint:?} has {actual:?}"
    )]
    ShapeMismatch {
        /// Root section name.
        root: String,
        /// Tensor key.
        key: String,
        /// Checkpoint that contributed the mismatching tensor.
        checkpoint: PathBuf,
        /// Shape already accumulated.
        expected: Vec<usize>,
        /// Shape of the incoming tensor.
        actual: Vec<usize>,
    },

    /// A selected entry is not a tensor.
    #[error("Cannot merge '{key}' in root '{root}': expected a tensor, found a {found} in {checkpoint:?}")]
    NotATensor {
        /// Root section name.
        root: String,
        /// Entry key.
        key: String,
        /// Kind actually found.
        found: ValueKind,
        /// Checkpoint holding the entry.
        checkpoint: PathBuf,
    },

    /// Requested root is missing from a checkpoint.
    #[error("Root '{root}' not found in {checkpoint:?}")]
    RootNotFound {
        /// Root section name.
        root: String,
        /// Checkpoint that lacks it.
        checkpoint: PathBuf,
    },

    /// Requested root is not a mapping.
    #[error("Root '{root}' in {checkpoint:?} is a {found}, expected a mapping")]
    RootNotMapping {
        /// Root section name.
        root: String,
        /// Checkpoint holding the root.
        checkpoint: PathBuf,
        /// Kind actually found.
        found: ValueKind,
    },

    /// Number of alphas differs from the number of checkpoints.
    #[error("Got {alphas} alphas for {checkpoints} checkpoints")]
    AlphaCountMismatch {
        /// Number of alphas supplied.
        alphas: usize,
        /// Number of checkpoints supplied.
        checkpoints: usize,
    },

    /// Not enough checkpoints for a merge.
    #[error("Expected at least {expected} checkpoints, got {actual}")]
    NotEnoughModels {
        /// Expected number of checkpoints.
        expected: usize,
        /// Actual number of checkpoints.
        actual: usize,
    },

    /// Invalid merge configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_names_root_and_key() {
        let err = MergeError::ShapeMismatch {
            root: "state_dict".into(),
            key: "layer.main.weight".into(),
            checkpoint: "b.safetensors".into(),
            expected: vec![2, 3],
            actual: vec![3, 3],
        };
        let msg = err.to_string();
        assert!(msg.contains("state_dict"));
        assert!(msg.contains("layer.main.weight"));
        assert!(msg.contains("b.safetensors"));
    }

    #[test]
    fn test_not_a_tensor_names_kind() {
        let err = MergeError::NotATensor {
            root: "ALL".into(),
            key: "epoch".into(),
            found: ValueKind::Scalar,
            checkpoint: "a.ckpt".into(),
        };
        assert!(err.to_string().contains("found a scalar"));
    }

    #[test]
    fn test_checkpoint_errors_are_transparent() {
        let err: MergeError = CheckpointError::UnsupportedDtype("F8_E4M3".into()).into();
        assert_eq!(err.to_string(), "Unsupported dtype: F8_E4M3");
    }
}
