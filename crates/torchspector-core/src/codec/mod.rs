//! Reading and writing checkpoint files.
//!
//! The on-disk format is chosen by file extension. Both formats load into
//! the same [`Mapping`] shape, so callers never need to know which one was
//! used.
//!
//! | extension | format | load | save |
//! |---|---|---|---|
//! | `.safetensors` | safetensors | yes | yes |
//! | `.pt`, `.pth`, `.ckpt`, `.bin` | torch pickle | yes | no |

mod pickle_io;
mod safetensors_io;

use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use crate::{CheckpointError, Device, Mapping, Result};

/// On-disk checkpoint container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointFormat {
    /// Flat tensor archive in the safetensors layout.
    SafeTensors,
    /// PyTorch pickle archive.
    Pickle,
}

impl CheckpointFormat {
    /// Select the format from a path's extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "safetensors" => Ok(Self::SafeTensors),
            "pt" | "pth" | "ckpt" | "bin" => Ok(Self::Pickle),
            _ => Err(CheckpointError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }

    /// Whether checkpoints can be written in this format.
    pub const fn is_writable(&self) -> bool {
        matches!(self, Self::SafeTensors)
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SafeTensors => f.write_str("safetensors"),
            Self::Pickle => f.write_str("pickle"),
        }
    }
}

/// Load a checkpoint from disk.
///
/// Tensors are materialized in host memory whatever `device` asks for.
pub fn load_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<Mapping> {
    let path = path.as_ref();
    let format = CheckpointFormat::from_path(path)?;
    if device.is_accelerator() {
        debug!("Device {} requested; tensors are kept in host memory", device);
    }

    info!("Loading {} checkpoint {:?}", format, path);
    let checkpoint = match format {
        CheckpointFormat::SafeTensors => safetensors_io::load(path)?,
        CheckpointFormat::Pickle => pickle_io::load(path)?,
    };
    debug!("Loaded {} top-level entries from {:?}", checkpoint.len(), path);

    Ok(checkpoint)
}

/// Save a checkpoint to disk in the format selected by `path`.
pub fn save_checkpoint(checkpoint: &Mapping, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let format = CheckpointFormat::from_path(path)?;
    if !format.is_writable() {
        return Err(CheckpointError::ReadOnlyFormat {
            format: format.to_string(),
        });
    }

    info!("Saving checkpoint to {:?}", path);
    safetensors_io::save(checkpoint, path)
}
