//! Checkpoint value model, display flattening and codecs for TorchSpector.
//!
//! This crate provides the foundations shared by the TorchSpector tools:
//!
//! - The checkpoint value model ([`Value`], [`Mapping`], [`Tensor`], [`Scalar`])
//! - Tree flattening with traversal-wide name deduplication ([`flatten`])
//! - Removal of entries addressed by display-style key paths
//! - Loading and saving checkpoints (safetensors, torch pickle)
//! - Common type definitions ([`Dtype`], [`Device`]) and errors
//!
//! # Example
//!
//! ```ignore
//! use torchspector_core::{load_checkpoint, DisplayTree, Device};
//!
//! let checkpoint = load_checkpoint("model.safetensors", &Device::Cpu)?;
//! print!("{}", DisplayTree::build(&checkpoint).render_text(None));
//! ```

#![warn(missing_docs)]

pub mod codec;
mod error;
pub mod flatten;
pub mod remove;
mod tensor;
mod types;
mod value;

pub use codec::{load_checkpoint, save_checkpoint, CheckpointFormat};
pub use error::*;
pub use flatten::{dedup_key, flatten, DisplayNode, DisplayTree, KeysSeen};
pub use remove::{remove_key, remove_nested_key, remove_nested_value};
pub use tensor::{format_shape, Tensor, TensorData};
pub use types::*;
pub use value::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{CheckpointError, Result};
    pub use crate::flatten::{flatten, DisplayNode, DisplayTree};
    pub use crate::tensor::Tensor;
    pub use crate::types::{Device, Dtype};
    pub use crate::value::{Checkpoint, Mapping, Scalar, Value, ValueKind};
}
