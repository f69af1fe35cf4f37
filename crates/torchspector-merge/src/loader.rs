//! Checkpoint loading for ratio merges.
//!
//! The merge engine never touches the filesystem itself. It asks a
//! [`CheckpointLoader`] for one checkpoint at a time, so at most one loaded
//! checkpoint is resident next to the accumulator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use torchspector_core::{load_checkpoint, Device, Mapping};
use tracing::{debug, info};

use crate::{MergeError, Result};

/// Trait for materializing checkpoints.
pub trait CheckpointLoader: Send + Sync {
    /// Load the checkpoint identified by `handle` onto `device`.
    fn load(&self, handle: &Path, device: &Device) -> Result<Mapping>;

    /// Release device-resident caches before a merge starts.
    fn release_device_caches(&self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

/// Loader that reads checkpoint files through the core codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLoader;

impl FileLoader {
    /// Create a file loader.
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointLoader for FileLoader {
    fn load(&self, handle: &Path, device: &Device) -> Result<Mapping> {
        if !handle.is_file() {
            return Err(MergeError::ModelLoad(format!(
                "No checkpoint file at {:?}",
                handle
            )));
        }
        debug!("Loading {:?} on {}", handle, device);
        let checkpoint = load_checkpoint(handle, device)?;
        info!("Loaded {:?} ({} top-level entries)", handle, checkpoint.len());
        Ok(checkpoint)
    }

    fn release_device_caches(&self, device: &Device) -> Result<()> {
        if device.is_accelerator() {
            // Tensors live in host memory; there is nothing cached on the device.
            debug!("No device caches to release on {}", device);
        }
        Ok(())
    }
}

/// What an [`InMemoryLoader`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// Caches were released for a device.
    Released(Device),
    /// A checkpoint was loaded.
    Loaded(PathBuf),
}

/// Loader serving checkpoints registered in memory.
///
/// Records every call so merge ordering can be observed.
#[derive(Debug, Default)]
pub struct InMemoryLoader {
    checkpoints: HashMap<PathBuf, Mapping>,
    events: Mutex<Vec<LoaderEvent>>,
}

impl InMemoryLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint under `handle`.
    pub fn insert(&mut self, handle: impl Into<PathBuf>, checkpoint: Mapping) {
        self.checkpoints.insert(handle.into(), checkpoint);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, handle: impl Into<PathBuf>, checkpoint: Mapping) -> Self {
        self.insert(handle, checkpoint);
        self
    }

    /// Calls recorded so far.
    pub fn events(&self) -> Vec<LoaderEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of checkpoints loaded so far.
    pub fn load_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LoaderEvent::Loaded(_)))
            .count()
    }

    fn record(&self, event: LoaderEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl CheckpointLoader for InMemoryLoader {
    fn load(&self, handle: &Path, _device: &Device) -> Result<Mapping> {
        let checkpoint = self
            .checkpoints
            .get(handle)
            .cloned()
            .ok_or_else(|| MergeError::ModelLoad(format!("Unknown checkpoint {:?}", handle)))?;
        self.record(LoaderEvent::Loaded(handle.to_path_buf()));
        Ok(checkpoint)
    }

    fn release_device_caches(&self, device: &Device) -> Result<()> {
        self.record(LoaderEvent::Released(*device));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torchspector_core::{save_checkpoint, Tensor};

    #[test]
    fn test_in_memory_loader_records_events() {
        let loader = InMemoryLoader::new().with("a", Mapping::new());
        loader.release_device_caches(&Device::Cpu).unwrap();
        loader.load(Path::new("a"), &Device::Cpu).unwrap();
        assert_eq!(
            loader.events(),
            vec![
                LoaderEvent::Released(Device::Cpu),
                LoaderEvent::Loaded(PathBuf::from("a")),
            ]
        );
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_in_memory_loader_unknown_handle() {
        let loader = InMemoryLoader::new();
        let err = loader.load(Path::new("missing"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, MergeError::ModelLoad(_)));
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn test_file_loader_reads_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut checkpoint = Mapping::new();
        checkpoint.insert("w", Tensor::from_f32(&[2], vec![1.0, 2.0]).unwrap());
        save_checkpoint(&checkpoint, &path).unwrap();

        let loaded = FileLoader::new().load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_file_loader_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileLoader::new()
            .load(&dir.path().join("nope.safetensors"), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, MergeError::ModelLoad(_)));
    }
}
