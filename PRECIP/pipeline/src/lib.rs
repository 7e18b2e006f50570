#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Streaming data pipeline for precipitation CNN training: per-file image reading,
//! single-pass normalization statistics, reversible normalization, shuffled batch
//! generation, and sub-batched inference.

/// Pipeline configuration and channel naming.
#[path = "../config.rs"]
pub mod config;

/// Error type shared by the data modules.
#[path = "../error.rs"]
pub mod error;

/// Source file readers.
#[path = "../reader.rs"]
pub mod reader;

/// NetCDF source files.
#[cfg(feature = "netcdf")]
#[path = "../netcdf_reader.rs"]
pub mod netcdf_reader;

/// Per-channel normalization tables and transforms.
#[path = "../normalization.rs"]
pub mod normalization;

/// Streaming moment accumulation over a corpus.
#[path = "../stats.rs"]
pub mod stats;

/// Restartable batch generator.
#[path = "../generator.rs"]
pub mod generator;

/// Model metadata persisted beside each artifact.
#[path = "../metadata.rs"]
pub mod metadata;

/// Structured log emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Time-string conversion helpers.
#[path = "../timefmt.rs"]
pub mod timefmt;

/// Model traits, inference, and the training loop.
#[path = "../training/main.rs"]
pub mod training;

#[cfg(test)]
#[path = "../fixtures.rs"]
mod fixtures;

pub use config::{ChannelName, LeftoverPolicy, PipelineConfig, Scheme, TargetPoints};
pub use error::{PipelineError, Result};
pub use generator::{Batch, BatchGenerator, GeneratorState};
pub use metadata::{find_metadata, read_metadata, write_metadata, ModelMetadata};
pub use normalization::{NormalizationEntry, NormalizationTable};
pub use reader::{count_examples, ImageReader, ImageRecord, NpzImageReader};
pub use stats::{compute_predictor_table, compute_target_table, StatsAccumulator};
pub use telemetry::PipelineTelemetry;
