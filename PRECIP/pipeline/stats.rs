//! Online per-channel statistics over a corpus read one file at a time.
//!
//! Each file's values are folded into running moments with sample-count weights, so the
//! final mean and standard deviation do not depend on file order or chunking, and only
//! one file is ever held in memory.

use std::path::PathBuf;

use indexmap::IndexMap;
use ndarray::{s, Axis};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::{ChannelName, PipelineConfig, Scheme, TargetPoints},
    error::{PipelineError, Result},
    normalization::{NormalizationEntry, NormalizationTable},
    reader::{ImageReader, ImageRecord},
    telemetry::{emit, PipelineTelemetry},
};

/// Running count, mean and mean of squares (plus extrema) for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningMoments {
    /// Number of values folded in so far.
    pub count: u64,
    /// Mean of all values seen.
    pub mean: f64,
    /// Mean of all squared values seen.
    pub mean_of_squares: f64,
    /// Smallest value seen.
    pub min: f64,
    /// Largest value seen.
    pub max: f64,
}

impl Default for RunningMoments {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            mean_of_squares: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningMoments {
    /// Moments of a single chunk of values.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut count = 0_u64;
        let mut sum = 0.0;
        let mut sum_of_squares = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &value in values {
            count += 1;
            sum += value;
            sum_of_squares += value * value;
            min = min.min(value);
            max = max.max(value);
        }
        if count == 0 {
            return Self::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let n = count as f64;
        Self {
            count,
            mean: sum / n,
            mean_of_squares: sum_of_squares / n,
            min,
            max,
        }
    }

    /// Folds a chunk of values in.
    pub fn fold<'a>(&mut self, values: impl IntoIterator<Item = &'a f64>) {
        self.merge(&Self::from_values(values));
    }

    /// Combines with another partial result, weighting each side by its sample count.
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        let total = self.count + other.count;
        #[allow(clippy::cast_precision_loss)]
        let (own_weight, other_weight, total_weight) =
            (self.count as f64, other.count as f64, total as f64);
        self.mean = self.mean.mul_add(own_weight, other.mean * other_weight) / total_weight;
        self.mean_of_squares = self
            .mean_of_squares
            .mul_add(own_weight, other.mean_of_squares * other_weight)
            / total_weight;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count = total;
    }

    /// Fails when a NaN or infinite value was folded in.
    ///
    /// `f64::min`/`max` skip NaN, so the extrema alone cannot reveal one; the means can.
    pub fn ensure_finite(&self, channel: &str) -> Result<()> {
        if self.mean.is_finite() && self.mean_of_squares.is_finite() {
            return Ok(());
        }
        Err(PipelineError::normalization(
            channel,
            format!(
                "non-finite values among {} samples (mean {}, mean of squares {})",
                self.count, self.mean, self.mean_of_squares
            ),
        ))
    }

    /// Bessel-corrected standard deviation `sqrt(n/(n-1) * (E[x^2] - E[x]^2))`.
    ///
    /// Rounding can push the variance slightly below zero; it is clamped to zero.
    pub fn standard_deviation(&self, channel: &str) -> Result<f64> {
        if self.count <= 1 {
            return Err(PipelineError::StatsDegenerate {
                channel: channel.to_owned(),
                count: self.count,
            });
        }
        self.ensure_finite(channel)?;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let variance = (n / (n - 1.0)) * self.mean.mul_add(-self.mean, self.mean_of_squares);
        Ok(variance.max(0.0).sqrt())
    }
}

/// Per-channel running moments in channel order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsAccumulator {
    channels: IndexMap<ChannelName, RunningMoments>,
}

impl StatsAccumulator {
    /// Creates an accumulator with the given channels registered in order.
    pub fn new<N: Into<ChannelName>>(names: impl IntoIterator<Item = N>) -> Self {
        Self {
            channels: names
                .into_iter()
                .map(|name| (name.into(), RunningMoments::default()))
                .collect(),
        }
    }

    /// Folds a chunk of values into `channel`.
    pub fn fold<'a>(&mut self, channel: &str, values: impl IntoIterator<Item = &'a f64>) {
        self.channels
            .entry(channel.to_owned())
            .or_default()
            .fold(values);
    }

    /// Folds every predictor channel of a record.
    pub fn observe_predictors(&mut self, record: &ImageRecord) {
        for (index, name) in record.predictor_names.iter().enumerate() {
            self.fold(name, record.predictors.index_axis(Axis(3), index));
        }
    }

    /// Folds every target block of a record; all spatial columns of a target count.
    pub fn observe_targets(&mut self, record: &ImageRecord) {
        let width = record.target_block_width();
        for (block, name) in record.target_names.iter().enumerate() {
            self.fold(
                name,
                record
                    .targets
                    .slice(s![.., block * width..(block + 1) * width]),
            );
        }
    }

    /// Combines a partial accumulator built elsewhere (another shard of the corpus).
    pub fn merge(&mut self, other: &Self) {
        for (name, moments) in &other.channels {
            self.channels.entry(name.clone()).or_default().merge(moments);
        }
    }

    /// Moments for one channel.
    #[must_use]
    pub fn moments(&self, channel: &str) -> Option<&RunningMoments> {
        self.channels.get(channel)
    }

    /// Builds a z-score table; any channel with fewer than two samples fails.
    pub fn finalize_z_score(&self) -> Result<NormalizationTable> {
        let mut entries = Vec::with_capacity(self.channels.len());
        for (name, moments) in &self.channels {
            let std = moments.standard_deviation(name)?;
            entries.push((name.clone(), NormalizationEntry::ZScore { mean: moments.mean, std }));
        }
        Ok(NormalizationTable::from_entries(entries))
    }

    /// Builds a min-max table from the observed extrema.
    pub fn finalize_min_max(&self) -> Result<NormalizationTable> {
        let mut entries = Vec::with_capacity(self.channels.len());
        for (name, moments) in &self.channels {
            if moments.count == 0 {
                return Err(PipelineError::StatsDegenerate {
                    channel: name.clone(),
                    count: 0,
                });
            }
            moments.ensure_finite(name)?;
            entries.push((
                name.clone(),
                NormalizationEntry::MinMax {
                    min: moments.min,
                    max: moments.max,
                },
            ));
        }
        Ok(NormalizationTable::from_entries(entries))
    }

    /// Builds a table for `scheme`.
    pub fn finalize(&self, scheme: Scheme) -> Result<NormalizationTable> {
        match scheme {
            Scheme::ZScore => self.finalize_z_score(),
            Scheme::MinMax => self.finalize_min_max(),
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Predictors,
    Targets,
}

impl Side {
    const fn label(self) -> &'static str {
        match self {
            Self::Predictors => "predictor",
            Self::Targets => "target",
        }
    }
}

fn accumulate_corpus<R: ImageReader>(
    reader: &R,
    paths: &[PathBuf],
    points: Option<&TargetPoints>,
    side: Side,
    names: &[ChannelName],
    telemetry: Option<&PipelineTelemetry>,
) -> Result<StatsAccumulator> {
    if paths.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "cannot compute {} statistics over an empty file list",
            side.label()
        )));
    }
    let mut accumulator = StatsAccumulator::new(names.iter().cloned());
    for path in paths {
        let record = reader.read(path, points)?;
        match side {
            Side::Predictors => accumulator.observe_predictors(&record),
            Side::Targets => accumulator.observe_targets(&record),
        }
        emit(
            telemetry,
            LogLevel::Debug,
            "stats_file_folded",
            json!({ "side": side.label(), "path": path, "examples": record.num_examples() }),
        );
    }
    Ok(accumulator)
}

fn finalize_logged(
    accumulator: &StatsAccumulator,
    scheme: Scheme,
    side: Side,
    telemetry: Option<&PipelineTelemetry>,
) -> Result<NormalizationTable> {
    let table = accumulator.finalize(scheme)?;
    for (name, entry) in table.iter() {
        let [first, second] = entry.to_pair();
        emit(
            telemetry,
            LogLevel::Info,
            "stats_channel_finalized",
            json!({ "side": side.label(), "channel": name, "scheme": scheme, "params": [first, second] }),
        );
    }
    Ok(table)
}

/// One pass over `paths` producing the predictor table in `config.predictor_scheme`.
pub fn compute_predictor_table<R: ImageReader>(
    reader: &R,
    paths: &[PathBuf],
    config: &PipelineConfig,
    telemetry: Option<&PipelineTelemetry>,
) -> Result<NormalizationTable> {
    let accumulator = accumulate_corpus(
        reader,
        paths,
        config.target_points.as_ref(),
        Side::Predictors,
        &config.predictor_names,
        telemetry,
    )?;
    finalize_logged(&accumulator, config.predictor_scheme, Side::Predictors, telemetry)
}

/// One pass over `paths` producing the target table in `config.target_scheme`.
pub fn compute_target_table<R: ImageReader>(
    reader: &R,
    paths: &[PathBuf],
    config: &PipelineConfig,
    telemetry: Option<&PipelineTelemetry>,
) -> Result<NormalizationTable> {
    let accumulator = accumulate_corpus(
        reader,
        paths,
        config.target_points.as_ref(),
        Side::Targets,
        &config.target_names,
        telemetry,
    )?;
    finalize_logged(&accumulator, config.target_scheme, Side::Targets, telemetry)
}
