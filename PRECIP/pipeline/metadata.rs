//! Model metadata persisted next to a trained model as JSON.
//!
//! Normalization tables cross this boundary as plain `name -> [a, b]` lists; the scheme
//! fields say how to read the two slots back.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{ChannelName, Scheme},
    error::{PipelineError, Result},
    normalization::NormalizationTable,
};

/// Everything needed to rebuild the data pipeline a model was trained with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// Identifier of the training run.
    pub run_id: Uuid,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Files the training generator drew from.
    pub training_file_names: Vec<PathBuf>,
    /// Predictor table as `name -> [a, b]`.
    pub normalization_dict: IndexMap<ChannelName, [f64; 2]>,
    /// Target table as `name -> [a, b]`.
    pub normalization_dict_targ: IndexMap<ChannelName, [f64; 2]>,
    /// How to read `normalization_dict`.
    pub predictor_scheme: Scheme,
    /// How to read `normalization_dict_targ`.
    pub target_scheme: Scheme,
    /// Examples per batch.
    pub num_examples_per_batch: usize,
    /// Training batches per epoch.
    pub num_training_batches_per_epoch: usize,
    /// Files the validation generator drew from, if any.
    #[serde(default)]
    pub validation_file_names: Option<Vec<PathBuf>>,
    /// Validation batches per epoch, if validating.
    #[serde(default)]
    pub num_validation_batches_per_epoch: Option<usize>,
    /// Saved model artifact.
    #[serde(default)]
    pub cnn_file_name: Option<PathBuf>,
    /// Layer used for feature extraction.
    #[serde(default)]
    pub cnn_feature_layer_name: Option<String>,
}

impl ModelMetadata {
    /// Captures both tables in their persisted list form.
    #[must_use]
    pub fn new(
        training_file_names: Vec<PathBuf>,
        predictor_table: &NormalizationTable,
        target_table: &NormalizationTable,
        num_examples_per_batch: usize,
        num_training_batches_per_epoch: usize,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            training_file_names,
            normalization_dict: predictor_table.to_lists(),
            normalization_dict_targ: target_table.to_lists(),
            predictor_scheme: predictor_table.scheme().unwrap_or_default(),
            target_scheme: target_table.scheme().unwrap_or_default(),
            num_examples_per_batch,
            num_training_batches_per_epoch,
            validation_file_names: None,
            num_validation_batches_per_epoch: None,
            cnn_file_name: None,
            cnn_feature_layer_name: None,
        }
    }

    /// Records validation settings.
    #[must_use]
    pub fn with_validation(mut self, files: Vec<PathBuf>, batches_per_epoch: usize) -> Self {
        self.validation_file_names = Some(files);
        self.num_validation_batches_per_epoch = Some(batches_per_epoch);
        self
    }

    /// Records the model artifact path.
    #[must_use]
    pub fn with_model_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cnn_file_name = Some(path.into());
        self
    }

    /// Predictor table rebuilt from its lists.
    #[must_use]
    pub fn predictor_table(&self) -> NormalizationTable {
        NormalizationTable::from_lists(&self.normalization_dict, self.predictor_scheme)
    }

    /// Target table rebuilt from its lists.
    #[must_use]
    pub fn target_table(&self) -> NormalizationTable {
        NormalizationTable::from_lists(&self.normalization_dict_targ, self.target_scheme)
    }
}

/// Writes metadata as JSON, creating parent directories.
///
/// Non-finite table slots are rejected: JSON would store them as `null` and the file
/// could not be read back.
pub fn write_metadata(metadata: &ModelMetadata, path: impl AsRef<Path>) -> Result<()> {
    let tables = metadata.normalization_dict.iter().chain(&metadata.normalization_dict_targ);
    for (name, pair) in tables {
        if pair.iter().any(|value| !value.is_finite()) {
            return Err(PipelineError::normalization(
                name.as_str(),
                format!("table entry {pair:?} is not finite and cannot be persisted"),
            ));
        }
    }
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(metadata)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Reads metadata written by [`write_metadata`].
pub fn read_metadata(path: impl AsRef<Path>) -> Result<ModelMetadata> {
    let contents = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}

/// Metadata path for a model file: `<dir>/<stem>_metadata.json`.
#[must_use]
pub fn metadata_path_for(model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .map_or_else(|| "model".into(), |stem| stem.to_string_lossy());
    let file_name = format!("{stem}_metadata.json");
    model_path
        .parent()
        .map_or_else(|| PathBuf::from(&file_name), |dir| dir.join(&file_name))
}

/// Locates the metadata file for `model_path`; with `required`, a missing file is an error.
pub fn find_metadata(model_path: &Path, required: bool) -> Result<PathBuf> {
    let path = metadata_path_for(model_path);
    if required && !path.is_file() {
        return Err(PipelineError::Configuration(format!(
            "cannot find metadata file, expected at {}",
            path.display()
        )));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::NormalizationEntry;
    use tempfile::tempdir;

    fn tables() -> (NormalizationTable, NormalizationTable) {
        (
            NormalizationTable::from_entries([
                ("u10", NormalizationEntry::ZScore { mean: 1.5, std: 3.25 }),
                ("t2m", NormalizationEntry::ZScore { mean: 280.0, std: 7.5 }),
            ]),
            NormalizationTable::from_entries([("rr_obs", NormalizationEntry::MinMax { min: 0.0, max: 42.0 })]),
        )
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let (predictors, targets) = tables();
        let metadata = ModelMetadata::new(vec!["train/a.npz".into()], &predictors, &targets, 64, 100)
            .with_validation(vec!["val/b.npz".into()], 10)
            .with_model_file(dir.path().join("cnn.bin"));
        let path = dir.path().join("models/cnn_metadata.json");
        write_metadata(&metadata, &path).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["normalization_dict"]["t2m"], serde_json::json!([280.0, 7.5]));
        assert_eq!(raw["normalization_dict_targ"]["rr_obs"], serde_json::json!([0.0, 42.0]));

        let restored = read_metadata(&path).unwrap();
        assert_eq!(restored, metadata);
        assert_eq!(restored.predictor_table(), predictors);
        assert_eq!(restored.target_table(), targets);
    }

    #[test]
    fn non_finite_tables_are_not_written() {
        let dir = tempdir().unwrap();
        let (predictors, _) = tables();
        let targets = NormalizationTable::from_entries([(
            "rr_obs",
            NormalizationEntry::ZScore { mean: f64::NAN, std: 0.0 },
        )]);
        let metadata = ModelMetadata::new(vec![], &predictors, &targets, 8, 1);
        let path = dir.path().join("cnn_metadata.json");
        let err = write_metadata(&metadata, &path).unwrap_err();
        assert!(matches!(err, PipelineError::Normalization { ref channel, .. } if channel == "rr_obs"));
        assert!(!path.exists());
    }

    #[test]
    fn metadata_path_sits_next_to_model() {
        let path = metadata_path_for(Path::new("/models/run7/cnn.h5"));
        assert_eq!(path, PathBuf::from("/models/run7/cnn_metadata.json"));
        let dir = tempdir().unwrap();
        let model = dir.path().join("missing.bin");
        assert!(find_metadata(&model, false).is_ok());
        assert!(matches!(find_metadata(&model, true), Err(PipelineError::Configuration(_))));
    }
}
