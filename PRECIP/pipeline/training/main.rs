//! Model-facing side of the pipeline: model capabilities, sub-batched inference, and
//! the epoch loop that feeds generators to a trainable model.

/// Checkpoint and early-stopping policies.
pub mod callbacks;
/// Per-epoch loss records.
pub mod history;
/// Sub-batched inference and prediction denormalization.
pub mod inference;
/// Model traits and a dense baseline.
pub mod model;
/// Epoch loop.
pub mod orchestrator;

pub use callbacks::{CheckpointPolicy, EarlyStopping, Monitor};
pub use history::{EpochRecord, TrainingHistory};
pub use inference::{apply_model, denormalize_predictions, InferenceOptions};
pub use model::{DenseRegressor, Model, TrainableModel};
pub use orchestrator::{TrainingOrchestrator, TrainingPlan};
