//! End-of-epoch policies: when to write the model and when to stop.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Minimum validation-loss decrease that counts as improvement.
pub const MIN_LOSS_DECREASE_FOR_EARLY_STOP: f32 = 0.005;

/// Epochs without improvement before training stops.
pub const NUM_EPOCHS_FOR_EARLY_STOPPING: usize = 15;

/// Loss watched by a checkpoint policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    /// Mean training loss.
    TrainingLoss,
    /// Mean validation loss.
    ValidationLoss,
}

/// Decides after each epoch whether the model artifact is rewritten.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    path: PathBuf,
    monitor: Monitor,
    save_best_only: bool,
    best: Option<f32>,
}

impl CheckpointPolicy {
    /// Saves after every epoch, watching training loss.
    #[must_use]
    pub fn every_epoch(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            monitor: Monitor::TrainingLoss,
            save_best_only: false,
            best: None,
        }
    }

    /// Saves only when validation loss reaches a new minimum.
    #[must_use]
    pub fn best_validation(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            monitor: Monitor::ValidationLoss,
            save_best_only: true,
            best: None,
        }
    }

    /// Artifact path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Watched loss.
    #[must_use]
    pub const fn monitor(&self) -> Monitor {
        self.monitor
    }

    /// Feeds the epoch's monitored loss; returns whether to save.
    pub fn should_save(&mut self, loss: f32) -> bool {
        let improved = self.best.map_or(true, |best| loss < best);
        if improved {
            self.best = Some(loss);
        }
        !self.save_best_only || improved
    }
}

/// Stops training once validation loss stalls.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    min_delta: f32,
    patience: usize,
    best: f32,
    wait: usize,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new(MIN_LOSS_DECREASE_FOR_EARLY_STOP, NUM_EPOCHS_FOR_EARLY_STOPPING)
    }
}

impl EarlyStopping {
    /// Creates a stopper; `patience` is clamped to at least one epoch.
    #[must_use]
    pub fn new(min_delta: f32, patience: usize) -> Self {
        Self {
            min_delta: min_delta.abs(),
            patience: patience.max(1),
            best: f32::INFINITY,
            wait: 0,
        }
    }

    /// Epochs since the last improvement.
    #[must_use]
    pub const fn wait(&self) -> usize {
        self.wait
    }

    /// Feeds an epoch's validation loss; returns true when training should stop.
    pub fn update(&mut self, validation_loss: f32) -> bool {
        if validation_loss < self.best - self.min_delta {
            self.best = validation_loss;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }
}
