//! The running weighted sum behind a ratio merge.
//!
//! A [`MergeAccumulator`] holds one section per requested root. Each
//! contributing checkpoint is folded in with [`MergeAccumulator::accumulate`],
//! which consumes the accumulator and hands it back, so the state is always
//! an explicit value owned by the caller.

use std::fmt;
use std::path::{Path, PathBuf};

use torchspector_core::{CheckpointError, Mapping, Value};
use tracing::warn;

use crate::{MergeError, Result};

/// Root name that selects the whole checkpoint.
pub const WHOLE_CHECKPOINT: &str = "ALL";

/// Which part of a checkpoint a merge reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RootSelector {
    /// A named top-level section, e.g. `state_dict`.
    Section(String),
    /// The checkpoint itself, without indexing.
    Whole,
}

impl RootSelector {
    /// Parse a root name; `ALL` selects the whole checkpoint.
    pub fn parse(name: &str) -> Self {
        if name == WHOLE_CHECKPOINT {
            Self::Whole
        } else {
            Self::Section(name.to_string())
        }
    }

    /// Resolve a list of root names. An empty list selects the whole checkpoint.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        if names.is_empty() {
            return Ok(vec![Self::Whole]);
        }
        let roots: Vec<Self> = names.iter().map(|n| Self::parse(n.as_ref())).collect();
        if roots.len() > 1 && roots.contains(&Self::Whole) {
            return Err(MergeError::InvalidConfig(format!(
                "root '{WHOLE_CHECKPOINT}' selects the whole checkpoint and cannot be combined with named roots"
            )));
        }
        for (idx, root) in roots.iter().enumerate() {
            if roots[..idx].contains(root) {
                return Err(MergeError::InvalidConfig(format!("root '{root}' is listed twice")));
            }
        }
        Ok(roots)
    }

    fn select<'a>(&self, checkpoint: &'a Mapping, source: &Path) -> Result<&'a Mapping> {
        match self {
            Self::Whole => Ok(checkpoint),
            Self::Section(name) => match checkpoint.get(name) {
                Some(Value::Mapping(section)) => Ok(section),
                Some(other) => Err(MergeError::RootNotMapping {
                    root: name.clone(),
                    checkpoint: source.to_path_buf(),
                    found: other.kind(),
                }),
                None => Err(MergeError::RootNotFound {
                    root: name.clone(),
                    checkpoint: source.to_path_buf(),
                }),
            },
        }
    }
}

impl fmt::Display for RootSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Section(name) => f.write_str(name),
            Self::Whole => f.write_str(WHOLE_CHECKPOINT),
        }
    }
}

/// Substring filter on tensor keys.
///
/// An empty filter matches every key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchWords(Vec<String>);

impl MatchWords {
    /// Build a filter; empty words are dropped.
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            words
                .into_iter()
                .map(Into::into)
                .filter(|w: &String| !w.is_empty())
                .collect(),
        )
    }

    /// Parse a comma separated list, trimming whitespace.
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(',').map(str::trim))
    }

    /// Whether `key` passes the filter.
    pub fn matches(&self, key: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|word| key.contains(word.as_str()))
    }

    /// Whether the filter accepts everything.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The configured words.
    pub fn words(&self) -> &[String] {
        &self.0
    }
}

/// Recoverable condition noticed during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeWarning {
    /// A key first appeared in a checkpoint after the first one, so earlier
    /// checkpoints contributed nothing to it.
    LateKey {
        /// Root section name.
        root: String,
        /// Tensor key.
        key: String,
        /// Checkpoint that introduced the key.
        checkpoint: PathBuf,
        /// Position of that checkpoint in the merge order.
        index: usize,
    },
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LateKey {
                root,
                key,
                checkpoint,
                index,
            } => write!(
                f,
                "key '{key}' in root '{root}' introduced by checkpoint #{index} ({checkpoint:?}), not present in earlier ones"
            ),
        }
    }
}

/// One checkpoint's contribution to a merge.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    /// The loaded checkpoint.
    pub checkpoint: &'a Mapping,
    /// Where it was loaded from, for diagnostics.
    pub source: &'a Path,
    /// Weight applied to its tensors.
    pub alpha: f32,
}

/// Per-root running sums of alpha-weighted tensors.
#[derive(Debug, Clone)]
pub struct MergeAccumulator {
    sections: Vec<(RootSelector, Mapping)>,
    matchwords: MatchWords,
    contributions: usize,
    warnings: Vec<MergeWarning>,
}

impl MergeAccumulator {
    /// Start an empty accumulator with one section per root.
    pub fn new(roots: &[RootSelector], matchwords: MatchWords) -> Self {
        Self {
            sections: roots.iter().map(|r| (r.clone(), Mapping::new())).collect(),
            matchwords,
            contributions: 0,
            warnings: Vec::new(),
        }
    }

    /// Fold one checkpoint into the running sums.
    ///
    /// Keys already present accumulate `alpha * tensor` in place; new keys are
    /// inserted as `alpha * tensor`. Sums are never renormalized, so a key
    /// missing from some checkpoints only carries the alphas of those that
    /// had it.
    pub fn accumulate(mut self, contribution: Contribution<'_>) -> Result<Self> {
        let index = self.contributions;
        for (root, section) in &mut self.sections {
            let theta = root.select(contribution.checkpoint, contribution.source)?;
            for (key, value) in theta {
                if !self.matchwords.matches(key) {
                    continue;
                }
                let Value::Tensor(tensor) = value else {
                    return Err(not_a_tensor(root, key, value, contribution.source));
                };

                match section.get_mut(key) {
                    Some(Value::Tensor(sum)) => {
                        sum.scaled_add(contribution.alpha, tensor).map_err(|err| match err {
                            CheckpointError::ShapeMismatch { expected, actual } => {
                                MergeError::ShapeMismatch {
                                    root: root.to_string(),
                                    key: key.to_string(),
                                    checkpoint: contribution.source.to_path_buf(),
                                    expected,
                                    actual,
                                }
                            }
                            other => other.into(),
                        })?;
                    }
                    // Sections only ever hold tensors.
                    _ => {
                        if index > 0 {
                            let warning = MergeWarning::LateKey {
                                root: root.to_string(),
                                key: key.to_string(),
                                checkpoint: contribution.source.to_path_buf(),
                                index,
                            };
                            warn!("{}", warning);
                            self.warnings.push(warning);
                        }
                        section.insert(key, tensor.scaled(contribution.alpha));
                    }
                }
            }
        }
        self.contributions += 1;
        Ok(self)
    }

    /// Number of checkpoints folded in so far.
    pub fn contributions(&self) -> usize {
        self.contributions
    }

    /// Warnings collected so far.
    pub fn warnings(&self) -> &[MergeWarning] {
        &self.warnings
    }

    /// Current sums for a root.
    pub fn section(&self, root: &RootSelector) -> Option<&Mapping> {
        self.sections
            .iter()
            .find(|(r, _)| r == root)
            .map(|(_, section)| section)
    }

    /// Finish the merge.
    ///
    /// Returns `{root: {key: tensor}}`, or the flat section when the whole
    /// checkpoint was the only root, together with the collected warnings.
    pub fn finish(self) -> (Mapping, Vec<MergeWarning>) {
        let whole_only = matches!(self.sections.as_slice(), [(RootSelector::Whole, _)]);
        let merged = if whole_only {
            self.sections
                .into_iter()
                .next()
                .map(|(_, section)| section)
                .unwrap_or_default()
        } else {
            self.sections
                .into_iter()
                .map(|(root, section)| (root.to_string(), section))
                .collect()
        };
        (merged, self.warnings)
    }
}

fn not_a_tensor(root: &RootSelector, key: &str, value: &Value, source: &Path) -> MergeError {
    MergeError::NotATensor {
        root: root.to_string(),
        key: key.to_string(),
        found: value.kind(),
        checkpoint: source.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torchspector_core::{Scalar, Tensor};

    fn t(values: &[f32]) -> Tensor {
        Tensor::from_f32(&[values.len()], values.to_vec()).unwrap()
    }

    fn flat(entries: &[(&str, &[f32])]) -> Mapping {
        entries.iter().map(|(k, v)| (*k, t(v))).collect()
    }

    fn contribution<'a>(checkpoint: &'a Mapping, alpha: f32) -> Contribution<'a> {
        Contribution {
            checkpoint,
            source: Path::new("mem"),
            alpha,
        }
    }

    fn values(map: &Mapping, key: &str) -> Vec<f32> {
        map.get(key).and_then(Value::as_tensor).unwrap().to_vec()
    }

    #[test]
    fn test_root_parsing() {
        assert_eq!(
            RootSelector::parse_list::<&str>(&[]).unwrap(),
            vec![RootSelector::Whole]
        );
        assert_eq!(
            RootSelector::parse_list(&["ALL"]).unwrap(),
            vec![RootSelector::Whole]
        );
        assert_eq!(
            RootSelector::parse_list(&["state_dict"]).unwrap(),
            vec![RootSelector::Section("state_dict".into())]
        );
        assert!(RootSelector::parse_list(&["ALL", "state_dict"]).is_err());
        assert!(RootSelector::parse_list(&["ema", "ema"]).is_err());
    }

    #[test]
    fn test_matchwords() {
        let words = MatchWords::parse_list("main, aux");
        assert!(words.matches("layer.main.weight"));
        assert!(words.matches("layer.aux.bias"));
        assert!(!words.matches("layer.other.weight"));

        assert!(MatchWords::default().matches("anything"));
        assert!(MatchWords::parse_list("").is_empty());
        assert!(MatchWords::new(["", ""]).matches("x"));
    }

    #[test]
    fn test_first_checkpoint_seeds_scaled_values() {
        let a = flat(&[("w", &[2.0, 4.0])]);
        let acc = MergeAccumulator::new(&[RootSelector::Whole], MatchWords::default())
            .accumulate(contribution(&a, 0.5))
            .unwrap();
        assert_eq!(acc.contributions(), 1);
        assert!(acc.warnings().is_empty());
        assert_eq!(values(acc.section(&RootSelector::Whole).unwrap(), "w"), vec![1.0, 2.0]);
    }

    #[test]
    fn test_late_key_warns_without_renormalizing() {
        let a = flat(&[("x", &[2.0])]);
        let b = flat(&[("y", &[4.0])]);
        let acc = MergeAccumulator::new(&[RootSelector::Whole], MatchWords::default())
            .accumulate(contribution(&a, 0.5))
            .unwrap()
            .accumulate(contribution(&b, 0.5))
            .unwrap();

        let (merged, warnings) = acc.finish();
        assert_eq!(values(&merged, "x"), vec![1.0]);
        assert_eq!(values(&merged, "y"), vec![2.0]);
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], MergeWarning::LateKey { key, index: 1, .. } if key == "y"));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let a = flat(&[("w", &[1.0, 2.0])]);
        let b = flat(&[("w", &[1.0, 2.0, 3.0])]);
        let acc = MergeAccumulator::new(&[RootSelector::Whole], MatchWords::default())
            .accumulate(contribution(&a, 1.0))
            .unwrap();
        let err = acc.accumulate(contribution(&b, 1.0)).unwrap_err();
        match err {
            MergeError::ShapeMismatch {
                root,
                key,
                expected,
                actual,
                ..
            } => {
                assert_eq!(root, "ALL");
                assert_eq!(key, "w");
                assert_eq!(expected, vec![2]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_tensor_values_are_rejected() {
        let mut a = flat(&[("w", &[1.0])]);
        a.insert("epoch", Scalar::Int(3));
        let err = MergeAccumulator::new(&[RootSelector::Whole], MatchWords::default())
            .accumulate(contribution(&a, 1.0))
            .unwrap_err();
        assert!(matches!(err, MergeError::NotATensor { ref key, .. } if key == "epoch"));
    }

    #[test]
    fn test_filtered_non_tensor_values_are_ignored() {
        let mut a = flat(&[("model.main.w", &[1.0])]);
        a.insert("epoch", Scalar::Int(3));
        let acc = MergeAccumulator::new(&[RootSelector::Whole], MatchWords::new(["main"]))
            .accumulate(contribution(&a, 1.0))
            .unwrap();
        let (merged, _) = acc.finish();
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["model.main.w"]);
    }

    #[test]
    fn test_named_roots_shape_output() {
        let mut a = Mapping::new();
        a.insert("state_dict", flat(&[("w", &[1.0])]));
        a.insert("ema", flat(&[("w", &[3.0])]));
        let roots = RootSelector::parse_list(&["state_dict", "ema"]).unwrap();
        let (merged, _) = MergeAccumulator::new(&roots, MatchWords::default())
            .accumulate(contribution(&a, 1.0))
            .unwrap()
            .finish();

        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["state_dict", "ema"]);
        let ema = merged.get("ema").and_then(Value::as_mapping).unwrap();
        assert_eq!(values(ema, "w"), vec![3.0]);
    }

    #[test]
    fn test_missing_root_and_non_mapping_root() {
        let a = flat(&[("w", &[1.0])]);
        let roots = RootSelector::parse_list(&["state_dict"]).unwrap();
        let err = MergeAccumulator::new(&roots, MatchWords::default())
            .accumulate(contribution(&a, 1.0))
            .unwrap_err();
        assert!(matches!(err, MergeError::RootNotFound { .. }));

        let roots = RootSelector::parse_list(&["w"]).unwrap();
        let err = MergeAccumulator::new(&roots, MatchWords::default())
            .accumulate(contribution(&a, 1.0))
            .unwrap_err();
        assert!(matches!(err, MergeError::RootNotMapping { .. }));
    }
}
