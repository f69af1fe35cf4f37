//! Error types for TorchSpector.

use std::path::PathBuf;

use thiserror::Error;

use crate::ValueKind;

/// Result type alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised while building, reading or writing checkpoints.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The file extension does not select a known checkpoint format.
    #[error(
        "Unsupported checkpoint format '{extension}' for {path:?}: expected .safetensors, .pt, .pth, .ckpt or .bin"
    )]
    UnsupportedFormat {
        /// Path that was requested.
        path: PathBuf,
        /// Extension found on the path (may be empty).
        extension: String,
    },

    /// The format can be read but not written.
    #[error("Writing {format} checkpoints is not supported, save as .safetensors instead")]
    ReadOnlyFormat {
        /// Name of the format.
        format: String,
    },

    /// Tensor element type has no in-memory representation.
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// Element count does not fit the requested shape.
    #[error("Invalid tensor shape {shape:?} for {len} elements")]
    InvalidShape {
        /// Requested shape.
        shape: Vec<usize>,
        /// Number of elements provided.
        len: usize,
    },

    /// Scaled addition between tensors of different shapes.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape of the tensor being added to.
        expected: Vec<usize>,
        /// Shape of the incoming tensor.
        actual: Vec<usize>,
    },

    /// A value kind the target format cannot store.
    #[error("Cannot store {kind} at '{key}': safetensors files hold tensors only")]
    NotSerializable {
        /// Flattened key of the offending entry.
        key: String,
        /// Kind of the offending value.
        kind: ValueKind,
    },

    /// Two entries flatten to the same tensor name.
    #[error("Duplicate tensor name after flattening nested keys: '{0}'")]
    DuplicateKey(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Safetensors errors.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Pickle archive errors.
    #[error("Pickle error: {0}")]
    Pickle(#[from] candle_core::Error),

    /// Zip container errors in torch archives.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A torch archive without the expected layout.
    #[error("Malformed torch archive: {0}")]
    MalformedArchive(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = CheckpointError::ShapeMismatch {
            expected: vec![2, 3],
            actual: vec![3, 2],
        };
        let msg = err.to_string();
        assert!(msg.contains("[2, 3]"));
        assert!(msg.contains("[3, 2]"));
    }

    #[test]
    fn test_unsupported_format_lists_alternatives() {
        let err = CheckpointError::UnsupportedFormat {
            path: "model.onnx".into(),
            extension: "onnx".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("onnx"));
        assert!(msg.contains(".safetensors"));
    }

    #[test]
    fn test_not_serializable_names_key_and_kind() {
        let err = CheckpointError::NotSerializable {
            key: "optimizer.step".into(),
            kind: ValueKind::Scalar,
        };
        let msg = err.to_string();
        assert!(msg.contains("optimizer.step"));
        assert!(msg.contains("scalar"));
    }
}
