use std::path::PathBuf;

use anyhow::{ensure, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use super::{
    callbacks::{CheckpointPolicy, EarlyStopping, MIN_LOSS_DECREASE_FOR_EARLY_STOP, NUM_EPOCHS_FOR_EARLY_STOPPING},
    history::{EpochRecord, TrainingHistory},
    model::TrainableModel,
};
use crate::{
    generator::BatchGenerator,
    metadata::{metadata_path_for, write_metadata, ModelMetadata},
    reader::ImageReader,
    telemetry::{emit, PipelineTelemetry},
};

/// Epoch layout and artifact location for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingPlan {
    /// Epochs to run unless early stopping triggers.
    pub num_epochs: usize,
    /// Generator steps per training epoch.
    pub num_training_batches_per_epoch: usize,
    /// Generator steps per validation pass.
    pub num_validation_batches_per_epoch: usize,
    /// Model artifact path; metadata lands beside it.
    pub model_path: PathBuf,
    /// Feature layer recorded in metadata for downstream inference.
    pub feature_layer_name: Option<String>,
    /// Minimum validation-loss decrease counted as improvement.
    pub min_loss_decrease: f32,
    /// Epochs without improvement before stopping.
    pub patience: usize,
}

impl Default for TrainingPlan {
    fn default() -> Self {
        Self {
            num_epochs: 100,
            num_training_batches_per_epoch: 32,
            num_validation_batches_per_epoch: 16,
            model_path: PathBuf::from("model.json"),
            feature_layer_name: None,
            min_loss_decrease: MIN_LOSS_DECREASE_FOR_EARLY_STOP,
            patience: NUM_EPOCHS_FOR_EARLY_STOPPING,
        }
    }
}

/// Drives a trainable model with batch generators for a fixed number of steps per epoch.
#[derive(Debug)]
pub struct TrainingOrchestrator<R> {
    plan: TrainingPlan,
    training: BatchGenerator<R>,
    validation: Option<BatchGenerator<R>>,
    telemetry: Option<PipelineTelemetry>,
}

impl<R: ImageReader> TrainingOrchestrator<R> {
    /// Creates an orchestrator without validation.
    pub fn new(plan: TrainingPlan, training: BatchGenerator<R>) -> anyhow::Result<Self> {
        ensure!(
            plan.num_training_batches_per_epoch > 0,
            "number of training batches per epoch must be positive"
        );
        Ok(Self {
            plan,
            training,
            validation: None,
            telemetry: None,
        })
    }

    /// Attaches a validation generator; it must normalize with the training tables.
    pub fn with_validation(mut self, validation: BatchGenerator<R>) -> anyhow::Result<Self> {
        ensure!(
            self.plan.num_validation_batches_per_epoch > 0,
            "number of validation batches per epoch must be positive"
        );
        ensure!(
            validation.predictor_table() == self.training.predictor_table()
                && validation.target_table() == self.training.target_table(),
            "validation generator must use the training normalization tables"
        );
        self.validation = Some(validation);
        Ok(self)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Metadata describing this run, as written beside the model.
    #[must_use]
    pub fn metadata(&self) -> ModelMetadata {
        let mut metadata = ModelMetadata::new(
            self.training.file_order().to_vec(),
            self.training.predictor_table(),
            self.training.target_table(),
            self.training.config().num_examples_per_batch,
            self.plan.num_training_batches_per_epoch,
        )
        .with_model_file(&self.plan.model_path);
        metadata.cnn_feature_layer_name.clone_from(&self.plan.feature_layer_name);
        if let Some(validation) = &self.validation {
            metadata = metadata.with_validation(
                validation.file_order().to_vec(),
                self.plan.num_validation_batches_per_epoch,
            );
        }
        metadata
    }

    /// Writes metadata, then trains epoch by epoch.
    ///
    /// Without validation the model is saved after every epoch; with validation it is
    /// saved only on a new best validation loss, and early stopping applies.
    #[allow(clippy::cast_precision_loss)]
    pub fn run<M: TrainableModel>(&mut self, model: &mut M) -> anyhow::Result<TrainingHistory> {
        let metadata = self.metadata();
        let metadata_path = metadata_path_for(&self.plan.model_path);
        write_metadata(&metadata, &metadata_path)
            .with_context(|| format!("writing metadata to {}", metadata_path.display()))?;

        let mut checkpoint = if self.validation.is_some() {
            CheckpointPolicy::best_validation(&self.plan.model_path)
        } else {
            CheckpointPolicy::every_epoch(&self.plan.model_path)
        };
        let mut stopper = EarlyStopping::new(self.plan.min_loss_decrease, self.plan.patience);
        let mut history = TrainingHistory::new(metadata.run_id);

        for epoch in 0..self.plan.num_epochs {
            let mut training_loss = 0.0;
            for step in 0..self.plan.num_training_batches_per_epoch {
                let batch = self
                    .training
                    .next_batch()
                    .with_context(|| format!("training batch {step} of epoch {epoch}"))?;
                training_loss += model.train_on_batch(&batch)?;
            }
            training_loss /= self.plan.num_training_batches_per_epoch as f32;

            let validation_loss = match self.validation.as_mut() {
                Some(validation) => {
                    let mut loss = 0.0;
                    for step in 0..self.plan.num_validation_batches_per_epoch {
                        let batch = validation
                            .next_batch()
                            .with_context(|| format!("validation batch {step} of epoch {epoch}"))?;
                        loss += model.evaluate_on_batch(&batch)?;
                    }
                    Some(loss / self.plan.num_validation_batches_per_epoch as f32)
                }
                None => None,
            };

            let mut record = EpochRecord {
                epoch,
                training_loss,
                validation_loss,
                checkpoint_saved: false,
                finished_at: Utc::now(),
            };
            if checkpoint.should_save(record.monitored_loss()) {
                model
                    .save(checkpoint.path())
                    .with_context(|| format!("saving model after epoch {epoch}"))?;
                record.checkpoint_saved = true;
            }
            emit(
                self.telemetry.as_ref(),
                LogLevel::Info,
                "epoch_complete",
                json!({
                    "epoch": epoch,
                    "loss": training_loss,
                    "val_loss": validation_loss,
                    "saved": record.checkpoint_saved,
                }),
            );
            history.epochs.push(record);

            if let Some(loss) = validation_loss {
                if stopper.update(loss) {
                    emit(
                        self.telemetry.as_ref(),
                        LogLevel::Info,
                        "early_stopping",
                        json!({ "epoch": epoch, "wait": stopper.wait() }),
                    );
                    history.stopped_early = true;
                    break;
                }
            }
        }
        Ok(history)
    }
}
