use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Losses recorded at the end of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean training loss over the epoch's steps.
    pub training_loss: f32,
    /// Mean validation loss, when a validation generator is attached.
    pub validation_loss: Option<f32>,
    /// Whether the model artifact was written after this epoch.
    pub checkpoint_saved: bool,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

impl EpochRecord {
    /// Loss that drives checkpointing: validation when present, else training.
    #[must_use]
    pub fn monitored_loss(&self) -> f32 {
        self.validation_loss.unwrap_or(self.training_loss)
    }
}

/// Summary of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Run identifier shared with the model metadata.
    pub run_id: Uuid,
    /// One record per completed epoch.
    pub epochs: Vec<EpochRecord>,
    /// True when early stopping ended the run.
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// Creates an empty history.
    #[must_use]
    pub const fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            epochs: Vec::new(),
            stopped_early: false,
        }
    }

    /// Epoch with the lowest monitored loss.
    #[must_use]
    pub fn best(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .min_by(|a, b| a.monitored_loss().total_cmp(&b.monitored_loss()))
    }
}
