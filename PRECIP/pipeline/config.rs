use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Identifier of one predictor or target variable.
pub type ChannelName = String;

/// Predictor variables in channel-axis order.
pub const DEFAULT_PREDICTOR_NAMES: [&str; 9] = [
    "rr", "t2m", "u10", "v10", "u700", "v700", "rh700", "T700", "W700",
];

/// Observed precipitation target variable.
pub const DEFAULT_TARGET_NAME: &str = "rr_obs";

/// Sub-batch size used when applying a trained model to a large array.
pub const DEFAULT_INFERENCE_BATCH_SIZE: usize = 1000;

/// Normalization scheme for a channel table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    /// `(x - mean) / std`.
    #[default]
    ZScore,
    /// `(x - min) / (max - min)`.
    MinMax,
}

/// What the batch generator does with buffered examples that were not drawn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverPolicy {
    /// Drop the whole buffer after every draw.
    #[default]
    Discard,
    /// Keep unsampled examples and refill on top of them.
    Retain,
}

/// Paired grid points `(rows[i], cols[i])` selected from the target field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetPoints {
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl TargetPoints {
    /// Builds a point selection; both lists must be non-empty and equally long.
    pub fn new(rows: Vec<usize>, cols: Vec<usize>) -> Result<Self> {
        let points = Self { rows, cols };
        points.validate()?;
        Ok(points)
    }

    fn validate(&self) -> Result<()> {
        if self.rows.len() != self.cols.len() {
            return Err(PipelineError::Configuration(format!(
                "target point lists differ in length ({} rows, {} cols)",
                self.rows.len(),
                self.cols.len()
            )));
        }
        if self.rows.is_empty() {
            return Err(PipelineError::Configuration(
                "target point selection is empty".into(),
            ));
        }
        Ok(())
    }

    /// Number of selected points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no point is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates `(row, col)` pairs in selection order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }
}

/// Immutable settings handed to every component at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Predictor variables; order is the channel-axis order.
    pub predictor_names: Vec<ChannelName>,
    /// Target variables, laid out target-major in the flattened target array.
    pub target_names: Vec<ChannelName>,
    /// Examples per emitted batch.
    pub num_examples_per_batch: usize,
    /// Optional subset of target grid points.
    pub target_points: Option<TargetPoints>,
    /// Seed for file shuffling and batch sampling; entropy when absent.
    pub seed: Option<u64>,
    /// Scheme used for predictor tables.
    pub predictor_scheme: Scheme,
    /// Scheme used for target tables.
    pub target_scheme: Scheme,
    /// Handling of unsampled buffered examples.
    pub leftover_policy: LeftoverPolicy,
    /// Examples per forward pass during inference.
    pub inference_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            predictor_names: DEFAULT_PREDICTOR_NAMES.iter().map(|&name| name.to_owned()).collect(),
            target_names: vec![DEFAULT_TARGET_NAME.to_owned()],
            num_examples_per_batch: 512,
            target_points: None,
            seed: None,
            predictor_scheme: Scheme::ZScore,
            target_scheme: Scheme::ZScore,
            leftover_policy: LeftoverPolicy::Discard,
            inference_batch_size: DEFAULT_INFERENCE_BATCH_SIZE,
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config document; absent fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with a different batch size.
    #[must_use]
    pub fn with_batch_size(mut self, num_examples_per_batch: usize) -> Self {
        self.num_examples_per_batch = num_examples_per_batch;
        self
    }

    /// Returns a copy with a fixed RNG seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the invariants every component relies on.
    pub fn validate(&self) -> Result<()> {
        if self.predictor_names.is_empty() {
            return Err(PipelineError::Configuration(
                "predictor name list is empty".into(),
            ));
        }
        if self.target_names.is_empty() {
            return Err(PipelineError::Configuration(
                "target name list is empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for name in self.predictor_names.iter().chain(&self.target_names) {
            if !seen.insert(name.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "channel \"{name}\" is listed more than once"
                )));
            }
        }
        if self.num_examples_per_batch == 0 {
            return Err(PipelineError::Configuration(
                "num_examples_per_batch must be positive".into(),
            ));
        }
        if self.inference_batch_size == 0 {
            return Err(PipelineError::Configuration(
                "inference_batch_size must be positive".into(),
            ));
        }
        if let Some(points) = &self.target_points {
            points.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.predictor_names.len(), 9);
        assert_eq!(config.target_names, vec!["rr_obs".to_string()]);
        assert_eq!(config.target_scheme, Scheme::ZScore);
    }

    #[test]
    fn loads_partial_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"predictor_names": ["u10", "v10"], "num_examples_per_batch": 32,
                "target_points": {"rows": [1, 2], "cols": [3, 4]}, "target_scheme": "min_max"}"#,
        )
        .unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.predictor_names, vec!["u10", "v10"]);
        assert_eq!(config.num_examples_per_batch, 32);
        assert_eq!(config.target_scheme, Scheme::MinMax);
        assert_eq!(config.inference_batch_size, DEFAULT_INFERENCE_BATCH_SIZE);
        let points: Vec<_> = config.target_points.unwrap().iter().collect();
        assert_eq!(points, vec![(1, 3), (2, 4)]);
    }

    #[test]
    fn rejects_duplicates_and_zero_batch() {
        let mut config = PipelineConfig::default();
        config.target_names = vec!["rr".into()];
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
        let config = PipelineConfig::default().with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unpaired_points() {
        assert!(TargetPoints::new(vec![1, 2], vec![1]).is_err());
        assert!(TargetPoints::new(vec![], vec![]).is_err());
    }
}
