//! Ratio merging for TorchSpector
//!
//! Combines N checkpoints into one whose tensors are the alpha-weighted sum
//! of the inputs, restricted to chosen root sections and to keys matching
//! substring filters.
//!
//! Checkpoints are loaded strictly one at a time through a
//! [`CheckpointLoader`], so at most one input is resident next to the running
//! sums.
//!
//! # Example
//!
//! ```ignore
//! use torchspector_merge::{FileLoader, RatioMergeBuilder};
//!
//! let output = RatioMergeBuilder::new()
//!     .add_weighted_checkpoint("a.safetensors", 0.7)
//!     .add_weighted_checkpoint("b.safetensors", 0.3)
//!     .whole_checkpoint()
//!     .run(&FileLoader::new())?;
//!
//! for warning in &output.warnings {
//!     eprintln!("{warning}");
//! }
//! ```

#![warn(missing_docs)]

mod accumulator;
mod config;
mod error;
mod loader;
mod merge;

pub use accumulator::*;
pub use config::*;
pub use error::*;
pub use loader::*;
pub use merge::*;
