//! Configuration types for ratio merging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use torchspector_core::Device;

use crate::{MatchWords, MergeError, RatioMergeJob, RootSelector};

/// Complete ratio merge configuration, typically loaded from YAML.
///
/// ```yaml
/// models:
///   - model: a.safetensors
///     alpha: 0.7
///   - model: b.safetensors
///     alpha: 0.3
/// matchwords: [main, aux]
/// roots: [state_dict]
/// device: cpu
/// output_path: merged.safetensors
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioMergeConfig {
    /// Checkpoints to merge, in order.
    pub models: Vec<ModelConfig>,

    /// Substring filters on tensor keys. Empty keeps every key.
    #[serde(default)]
    pub matchwords: Vec<String>,

    /// Root sections to merge. Empty, or `[ALL]`, merges the whole checkpoint.
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,

    /// Placement hint passed to the loader.
    #[serde(default)]
    pub device: Device,

    /// Where to save the merged checkpoint.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

fn default_roots() -> Vec<String> {
    vec!["state_dict".to_string()]
}

/// A single checkpoint in the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Checkpoint path.
    pub model: PathBuf,

    /// Weight of this checkpoint. Omit on every model for a uniform `1/N`.
    #[serde(default)]
    pub alpha: Option<f32>,
}

impl RatioMergeConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.models.is_empty() {
            return Err(MergeError::NotEnoughModels {
                expected: 1,
                actual: 0,
            });
        }

        let weighted = self.models.iter().filter(|m| m.alpha.is_some()).count();
        if weighted != 0 && weighted != self.models.len() {
            return Err(MergeError::InvalidConfig(format!(
                "alpha given for {weighted} of {} models; set it on all or none",
                self.models.len()
            )));
        }

        if let Some(bad) = self.models.iter().filter_map(|m| m.alpha).find(|a| !a.is_finite()) {
            return Err(MergeError::InvalidConfig(format!("alpha {bad} is not finite")));
        }

        RootSelector::parse_list(&self.roots)?;
        Ok(())
    }

    /// Per-model alphas, or `None` when the merge should be uniform.
    pub fn alphas(&self) -> Option<Vec<f32>> {
        self.models.iter().map(|m| m.alpha).collect()
    }

    /// Validate and turn the configuration into a runnable job.
    pub fn to_job(&self) -> crate::Result<RatioMergeJob> {
        self.validate()?;
        RatioMergeJob::new(
            self.models.iter().map(|m| m.model.clone()).collect(),
            self.alphas(),
            MatchWords::new(self.matchwords.iter().cloned()),
            self.device,
            &self.roots,
        )
    }
}

impl Default for RatioMergeConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            matchwords: Vec::new(),
            roots: default_roots(),
            device: Device::Cpu,
            output_path: None,
        }
    }
}
