//! Ratio merge orchestration.
//!
//! This module provides the high-level API for running a ratio merge. It
//! validates the job, drives the loader one checkpoint at a time and folds
//! each one into a [`MergeAccumulator`].

use std::path::{Path, PathBuf};

use torchspector_core::{Device, Mapping};
use tracing::{debug, info};

use crate::{
    CheckpointLoader, Contribution, MatchWords, MergeAccumulator, MergeError, MergeWarning,
    Result, RootSelector,
};

/// Result of a ratio merge.
#[derive(Debug, Clone)]
pub struct MergeOutput {
    /// `{root: {key: tensor}}`, or a flat `{key: tensor}` for the whole checkpoint.
    pub merged: Mapping,
    /// Recoverable conditions noticed along the way.
    pub warnings: Vec<MergeWarning>,
}

/// A validated ratio merge.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioMergeJob {
    checkpoints: Vec<PathBuf>,
    alphas: Vec<f32>,
    matchwords: MatchWords,
    device: Device,
    roots: Vec<RootSelector>,
}

impl RatioMergeJob {
    /// Validate merge inputs.
    ///
    /// # Arguments
    /// * `checkpoints` - Checkpoint handles, merged in this order
    /// * `alphas` - One weight per checkpoint, or `None` for a uniform `1/N`
    /// * `matchwords` - Key filter
    /// * `device` - Placement hint for the loader
    /// * `roots` - Root names; empty or `ALL` merges the whole checkpoint
    pub fn new<S: AsRef<str>>(
        checkpoints: Vec<PathBuf>,
        alphas: Option<Vec<f32>>,
        matchwords: MatchWords,
        device: Device,
        roots: &[S],
    ) -> Result<Self> {
        if checkpoints.is_empty() {
            return Err(MergeError::NotEnoughModels {
                expected: 1,
                actual: 0,
            });
        }

        let alphas = match alphas {
            Some(alphas) if alphas.len() != checkpoints.len() => {
                return Err(MergeError::AlphaCountMismatch {
                    alphas: alphas.len(),
                    checkpoints: checkpoints.len(),
                });
            }
            Some(alphas) => alphas,
            None => vec![1.0 / checkpoints.len() as f32; checkpoints.len()],
        };

        let roots = RootSelector::parse_list(roots)?;

        Ok(Self {
            checkpoints,
            alphas,
            matchwords,
            device,
            roots,
        })
    }

    /// Checkpoint handles in merge order.
    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// Weight per checkpoint.
    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    /// Key filter.
    pub fn matchwords(&self) -> &MatchWords {
        &self.matchwords
    }

    /// Placement hint.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Selected roots.
    pub fn roots(&self) -> &[RootSelector] {
        &self.roots
    }
}

/// Run a validated ratio merge.
///
/// Releases device caches once, then loads, accumulates and drops each
/// checkpoint in order.
pub fn run_ratio_merge<L: CheckpointLoader + ?Sized>(
    loader: &L,
    job: &RatioMergeJob,
) -> Result<MergeOutput> {
    info!(
        "Starting ratio merge of {} checkpoints on {}",
        job.checkpoints.len(),
        job.device
    );
    debug!(
        "Roots: {:?}, matchwords: {:?}, alphas: {:?}",
        job.roots,
        job.matchwords.words(),
        job.alphas
    );

    loader.release_device_caches(&job.device)?;

    let mut accumulator = MergeAccumulator::new(&job.roots, job.matchwords.clone());
    for (idx, (path, &alpha)) in job.checkpoints.iter().zip(&job.alphas).enumerate() {
        info!(
            "Merging checkpoint {}/{}: {:?} (alpha {})",
            idx + 1,
            job.checkpoints.len(),
            path,
            alpha
        );
        let checkpoint = loader.load(path, &job.device)?;
        accumulator = accumulator.accumulate(Contribution {
            checkpoint: &checkpoint,
            source: path,
            alpha,
        })?;
    }

    let (merged, warnings) = accumulator.finish();
    info!(
        "Ratio merge complete: {} entries, {} warnings",
        merged.len(),
        warnings.len()
    );
    Ok(MergeOutput { merged, warnings })
}

/// Validate inputs and run a ratio merge in one call.
///
/// # Arguments
/// * `loader` - Source of checkpoints
/// * `checkpoints` - Checkpoint handles, merged in this order
/// * `alphas` - One weight per checkpoint, or `None` for a uniform `1/N`
/// * `matchwords` - Substring filters; empty keeps every key
/// * `device` - Placement hint for the loader
/// * `roots` - Root names; empty or `ALL` merges the whole checkpoint
pub fn ratio_merge<L, P, S>(
    loader: &L,
    checkpoints: &[P],
    alphas: Option<&[f32]>,
    matchwords: &[S],
    device: Device,
    roots: &[S],
) -> Result<MergeOutput>
where
    L: CheckpointLoader + ?Sized,
    P: AsRef<Path>,
    S: AsRef<str>,
{
    let job = RatioMergeJob::new(
        checkpoints.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        alphas.map(<[f32]>::to_vec),
        MatchWords::new(matchwords.iter().map(|w| w.as_ref().to_string())),
        device,
        roots,
    )?;
    run_ratio_merge(loader, &job)
}

/// Builder for creating ratio merges programmatically.
#[derive(Debug, Clone)]
pub struct RatioMergeBuilder {
    checkpoints: Vec<(PathBuf, Option<f32>)>,
    matchwords: Vec<String>,
    roots: Vec<String>,
    device: Device,
}

impl Default for RatioMergeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RatioMergeBuilder {
    /// Start a builder merging the `state_dict` root on the CPU.
    pub fn new() -> Self {
        Self {
            checkpoints: Vec::new(),
            matchwords: Vec::new(),
            roots: vec!["state_dict".to_string()],
            device: Device::Cpu,
        }
    }

    /// Add a checkpoint with the uniform weight.
    pub fn add_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoints.push((path.into(), None));
        self
    }

    /// Add a checkpoint with an explicit weight.
    pub fn add_weighted_checkpoint(mut self, path: impl Into<PathBuf>, alpha: f32) -> Self {
        self.checkpoints.push((path.into(), Some(alpha)));
        self
    }

    /// Add a key filter word.
    pub fn matchword(mut self, word: impl Into<String>) -> Self {
        self.matchwords.push(word.into());
        self
    }

    /// Replace the root list.
    pub fn roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Merge the whole checkpoint instead of named roots.
    pub fn whole_checkpoint(mut self) -> Self {
        self.roots.clear();
        self
    }

    /// Set the placement hint.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Build the merge job.
    pub fn build(self) -> Result<RatioMergeJob> {
        let weighted = self.checkpoints.iter().filter(|(_, a)| a.is_some()).count();
        if weighted != 0 && weighted != self.checkpoints.len() {
            return Err(MergeError::InvalidConfig(format!(
                "alpha given for {weighted} of {} checkpoints; set it on all or none",
                self.checkpoints.len()
            )));
        }
        let alphas: Option<Vec<f32>> = self.checkpoints.iter().map(|(_, a)| *a).collect();
        RatioMergeJob::new(
            self.checkpoints.into_iter().map(|(p, _)| p).collect(),
            alphas,
            MatchWords::new(self.matchwords),
            self.device,
            &self.roots,
        )
    }

    /// Build and run the merge.
    pub fn run<L: CheckpointLoader + ?Sized>(self, loader: &L) -> Result<MergeOutput> {
        let job = self.build()?;
        run_ratio_merge(loader, &job)
    }
}
