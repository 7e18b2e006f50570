//! Forward and inverse normalization transforms driven by per-channel tables.
//!
//! Predictor arrays carry channels on their trailing axis. Target arrays are
//! `[example, target * spatial]` with one contiguous column block per target name.

use indexmap::IndexMap;
use ndarray::{s, Array, Array2, Axis, Dimension, RemoveAxis};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ChannelName, Scheme},
    error::{PipelineError, Result},
};

/// Normalization parameters for one channel; the variant fixes the scheme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum NormalizationEntry {
    /// Z-score parameters.
    ZScore {
        /// Channel mean.
        mean: f64,
        /// Channel standard deviation.
        std: f64,
    },
    /// Min-max parameters.
    MinMax {
        /// Smallest observed value.
        min: f64,
        /// Largest observed value.
        max: f64,
    },
}

impl NormalizationEntry {
    /// Scheme this entry applies.
    #[must_use]
    pub const fn scheme(&self) -> Scheme {
        match self {
            Self::ZScore { .. } => Scheme::ZScore,
            Self::MinMax { .. } => Scheme::MinMax,
        }
    }

    /// Rejects entries whose scale is zero or non-finite.
    pub fn validate(&self, channel: &str) -> Result<()> {
        match *self {
            Self::ZScore { mean, std } => {
                if !mean.is_finite() || !std.is_finite() {
                    return Err(PipelineError::normalization(
                        channel,
                        format!("non-finite z-score parameters (mean {mean}, std {std})"),
                    ));
                }
                if std == 0.0 {
                    return Err(PipelineError::normalization(channel, "standard deviation is zero"));
                }
            }
            Self::MinMax { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(PipelineError::normalization(
                        channel,
                        format!("non-finite min-max parameters (min {min}, max {max})"),
                    ));
                }
                if max == min {
                    return Err(PipelineError::normalization(
                        channel,
                        format!("min and max are both {min}"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Raw value to normalized value.
    #[must_use]
    pub fn forward(&self, value: f64) -> f64 {
        match *self {
            Self::ZScore { mean, std } => (value - mean) / std,
            Self::MinMax { min, max } => (value - min) / (max - min),
        }
    }

    /// Normalized value back to raw value.
    #[must_use]
    pub fn inverse(&self, value: f64) -> f64 {
        match *self {
            Self::ZScore { mean, std } => std.mul_add(value, mean),
            Self::MinMax { min, max } => value.mul_add(max - min, min),
        }
    }

    /// Two-slot persisted form: `[mean, std]` or `[min, max]`.
    #[must_use]
    pub const fn to_pair(&self) -> [f64; 2] {
        match *self {
            Self::ZScore { mean, std } => [mean, std],
            Self::MinMax { min, max } => [min, max],
        }
    }

    /// Rebuilds an entry from its persisted form.
    #[must_use]
    pub const fn from_pair(pair: [f64; 2], scheme: Scheme) -> Self {
        match scheme {
            Scheme::ZScore => Self::ZScore {
                mean: pair[0],
                std: pair[1],
            },
            Scheme::MinMax => Self::MinMax {
                min: pair[0],
                max: pair[1],
            },
        }
    }
}

/// Channel name to entry mapping, built once and shared read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationTable {
    entries: IndexMap<ChannelName, NormalizationEntry>,
}

impl NormalizationTable {
    /// Builds a table from `(name, entry)` pairs, keeping their order.
    pub fn from_entries<N: Into<ChannelName>>(
        entries: impl IntoIterator<Item = (N, NormalizationEntry)>,
    ) -> Self {
        Self {
            entries: entries.into_iter().map(|(name, entry)| (name.into(), entry)).collect(),
        }
    }

    /// Entry for `channel`, if present.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<&NormalizationEntry> {
        self.entries.get(channel)
    }

    /// Entry for `channel`, or a configuration error naming it.
    pub fn entry(&self, channel: &str) -> Result<&NormalizationEntry> {
        self.entries.get(channel).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "normalization table has no entry for channel \"{channel}\""
            ))
        })
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelName, &NormalizationEntry)> {
        self.entries.iter()
    }

    /// Scheme shared by every entry, `None` for empty or mixed tables.
    #[must_use]
    pub fn scheme(&self) -> Option<Scheme> {
        let mut schemes = self.entries.values().map(NormalizationEntry::scheme);
        let first = schemes.next()?;
        schemes.all(|scheme| scheme == first).then_some(first)
    }

    /// Converts to plain `name -> [a, b]` lists for JSON persistence.
    #[must_use]
    pub fn to_lists(&self) -> IndexMap<ChannelName, [f64; 2]> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.to_pair()))
            .collect()
    }

    /// Rebuilds a table from persisted lists; `scheme` says how to read the slots.
    #[must_use]
    pub fn from_lists(lists: &IndexMap<ChannelName, [f64; 2]>, scheme: Scheme) -> Self {
        Self::from_entries(
            lists
                .iter()
                .map(|(name, pair)| (name.clone(), NormalizationEntry::from_pair(*pair, scheme))),
        )
    }

    fn resolve(&self, names: &[ChannelName]) -> Result<Vec<NormalizationEntry>> {
        names
            .iter()
            .map(|name| {
                let entry = *self.entry(name)?;
                entry.validate(name)?;
                Ok(entry)
            })
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Inverse,
}

impl Direction {
    fn apply(self, entry: &NormalizationEntry, value: f64) -> f64 {
        match self {
            Self::Forward => entry.forward(value),
            Self::Inverse => entry.inverse(value),
        }
    }
}

fn transform_channels<D>(
    mut array: Array<f64, D>,
    names: &[ChannelName],
    table: &NormalizationTable,
    direction: Direction,
) -> Result<Array<f64, D>>
where
    D: Dimension + RemoveAxis,
{
    let axis = Axis(array.ndim().saturating_sub(1));
    if array.ndim() == 0 || array.len_of(axis) != names.len() {
        return Err(PipelineError::Shape(format!(
            "array of shape {:?} does not carry {} channels on its last axis",
            array.shape(),
            names.len()
        )));
    }
    let entries = table.resolve(names)?;
    for (mut lane, entry) in array.axis_iter_mut(axis).zip(&entries) {
        lane.mapv_inplace(|value| direction.apply(entry, value));
    }
    Ok(array)
}

fn transform_targets(
    mut array: Array2<f64>,
    names: &[ChannelName],
    table: &NormalizationTable,
    direction: Direction,
) -> Result<Array2<f64>> {
    if names.is_empty() || array.ncols() % names.len() != 0 {
        return Err(PipelineError::Shape(format!(
            "{} target columns cannot be split into {} target blocks",
            array.ncols(),
            names.len()
        )));
    }
    let entries = table.resolve(names)?;
    let width = array.ncols() / names.len();
    for (block, entry) in entries.iter().enumerate() {
        array
            .slice_mut(s![.., block * width..(block + 1) * width])
            .mapv_inplace(|value| direction.apply(entry, value));
    }
    Ok(array)
}

/// Normalizes an array whose trailing axis holds the channels `names`.
pub fn normalize_predictors<D>(
    array: Array<f64, D>,
    names: &[ChannelName],
    table: &NormalizationTable,
) -> Result<Array<f64, D>>
where
    D: Dimension + RemoveAxis,
{
    transform_channels(array, names, table, Direction::Forward)
}

/// Exact inverse of [`normalize_predictors`].
pub fn denormalize_predictors<D>(
    array: Array<f64, D>,
    names: &[ChannelName],
    table: &NormalizationTable,
) -> Result<Array<f64, D>>
where
    D: Dimension + RemoveAxis,
{
    transform_channels(array, names, table, Direction::Inverse)
}

/// Normalizes a `[example, target * spatial]` target array block by block.
pub fn normalize_targets(
    array: Array2<f64>,
    names: &[ChannelName],
    table: &NormalizationTable,
) -> Result<Array2<f64>> {
    transform_targets(array, names, table, Direction::Forward)
}

/// Exact inverse of [`normalize_targets`].
pub fn denormalize_targets(
    array: Array2<f64>,
    names: &[ChannelName],
    table: &NormalizationTable,
) -> Result<Array2<f64>> {
    transform_targets(array, names, table, Direction::Inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::names;
    use ndarray::{Array1, Array4};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn assert_close(a: f64, b: f64) {
        let tolerance = 1e-5 * a.abs().max(b.abs()).max(1.0);
        assert!((a - b).abs() <= tolerance, "{a} != {b}");
    }

    #[test]
    fn z_score_scenario() {
        let table = NormalizationTable::from_entries([("A", NormalizationEntry::ZScore { mean: 10.0, std: 2.0 })]);
        let array = Array1::from(vec![14.0]);
        let normalized = normalize_predictors(array, &names(&["A"]), &table).unwrap();
        assert_close(normalized[0], 2.0);
        let restored = denormalize_predictors(normalized, &names(&["A"]), &table).unwrap();
        assert_close(restored[0], 14.0);
    }

    #[test]
    fn min_max_maps_to_unit_range() {
        let table = NormalizationTable::from_entries([("A", NormalizationEntry::MinMax { min: -2.0, max: 6.0 })]);
        let array = Array2::from_shape_vec((1, 3), vec![-2.0, 2.0, 6.0]).unwrap();
        let normalized = normalize_targets(array, &names(&["A"]), &table).unwrap();
        assert_eq!(normalized.row(0).to_vec(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn round_trip_random_tables() {
        let mut rng = SmallRng::seed_from_u64(7);
        let channels = names(&["a", "b", "c"]);
        for round in 0..20 {
            let table = NormalizationTable::from_entries(channels.iter().map(|name| {
                let entry = if round % 2 == 0 {
                    NormalizationEntry::ZScore {
                        mean: rng.gen_range(-100.0..100.0),
                        std: rng.gen_range(0.01..50.0),
                    }
                } else {
                    let min = rng.gen_range(-100.0..100.0);
                    NormalizationEntry::MinMax { min, max: min + rng.gen_range(0.01..200.0) }
                };
                (name.clone(), entry)
            }));
            let original = Array4::from_shape_fn((4, 3, 5, 3), |_| rng.gen_range(-500.0..500.0));
            let normalized = normalize_predictors(original.clone(), &channels, &table).unwrap();
            let restored = denormalize_predictors(normalized, &channels, &table).unwrap();
            for (a, b) in original.iter().zip(restored.iter()) {
                assert_close(*a, *b);
            }
        }
    }

    #[test]
    fn channels_use_their_own_entries() {
        let table = NormalizationTable::from_entries([
            ("a", NormalizationEntry::ZScore { mean: 1.0, std: 1.0 }),
            ("b", NormalizationEntry::ZScore { mean: 0.0, std: 10.0 }),
        ]);
        let array = Array2::from_shape_vec((2, 2), vec![1.0, 10.0, 3.0, -20.0]).unwrap();
        let normalized = normalize_predictors(array, &names(&["a", "b"]), &table).unwrap();
        assert_eq!(normalized, Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, -2.0]).unwrap());
    }

    #[test]
    fn target_blocks_are_independent() {
        let table = NormalizationTable::from_entries([
            ("p", NormalizationEntry::ZScore { mean: 0.0, std: 2.0 }),
            ("q", NormalizationEntry::MinMax { min: 0.0, max: 4.0 }),
        ]);
        let array = Array2::from_elem((2, 4), 4.0);
        let normalized = normalize_targets(array, &names(&["p", "q"]), &table).unwrap();
        assert_eq!(normalized.row(1).to_vec(), vec![2.0, 2.0, 1.0, 1.0]);
        let restored = denormalize_targets(normalized, &names(&["p", "q"]), &table).unwrap();
        assert!(restored.iter().all(|&value| (value - 4.0).abs() < 1e-12));
    }

    #[test]
    fn degenerate_scale_is_an_error() {
        let table = NormalizationTable::from_entries([("flat", NormalizationEntry::ZScore { mean: 3.0, std: 0.0 })]);
        let err = normalize_predictors(Array1::from(vec![3.0]), &names(&["flat"]), &table).unwrap_err();
        assert!(matches!(err, PipelineError::Normalization { ref channel, .. } if channel == "flat"));

        let table = NormalizationTable::from_entries([("span", NormalizationEntry::MinMax { min: 1.0, max: 1.0 })]);
        let err = normalize_targets(Array2::zeros((1, 1)), &names(&["span"]), &table).unwrap_err();
        assert!(matches!(err, PipelineError::Normalization { .. }));
    }

    #[test]
    fn missing_channel_is_configuration_error() {
        let table = NormalizationTable::from_entries([("a", NormalizationEntry::ZScore { mean: 0.0, std: 1.0 })]);
        let err = normalize_predictors(Array2::zeros((1, 2)), &names(&["a", "b"]), &table).unwrap_err();
        assert!(err.to_string().contains("\"b\""));
    }

    #[test]
    fn lists_round_trip_keeps_scheme_slots() {
        let table = NormalizationTable::from_entries([
            ("rr", NormalizationEntry::MinMax { min: 0.0, max: 80.0 }),
            ("t2m", NormalizationEntry::MinMax { min: 230.0, max: 310.0 }),
        ]);
        let lists = table.to_lists();
        assert_eq!(lists["rr"], [0.0, 80.0]);
        let json = serde_json::to_string(&lists).unwrap();
        assert_eq!(json, r#"{"rr":[0.0,80.0],"t2m":[230.0,310.0]}"#);
        let restored = NormalizationTable::from_lists(&serde_json::from_str(&json).unwrap(), Scheme::MinMax);
        assert_eq!(restored, table);
        assert_eq!(restored.scheme(), Some(Scheme::MinMax));
    }
}
