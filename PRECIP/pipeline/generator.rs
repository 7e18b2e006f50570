//! Restartable batch generator: shuffled file queue, in-memory example buffer,
//! uniform sampling without replacement.
//!
//! Each call to [`BatchGenerator::next_batch`] refills the buffer file by file (wrapping
//! round-robin through an order shuffled once at construction) until it holds at least
//! one batch, draws the batch from the whole buffer, normalizes it and casts it to `f32`.

use std::{path::PathBuf, sync::Arc};

use ndarray::{concatenate, Array2, Array4, ArrayView2, ArrayView4, Axis};
use rand::{rngs::SmallRng, seq::index, seq::SliceRandom, SeedableRng};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    config::{LeftoverPolicy, PipelineConfig},
    error::{PipelineError, Result},
    normalization::{normalize_predictors, normalize_targets, NormalizationTable},
    reader::{ImageReader, ImageRecord},
    telemetry::{emit, PipelineTelemetry},
};

/// One normalized training or validation batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[example, row, column, channel]` normalized predictors.
    pub predictors: Array4<f32>,
    /// `[example, target * spatial]` normalized targets.
    pub targets: Array2<f32>,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.predictors.len_of(Axis(0))
    }

    /// True for a batch without examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Phase of the generator's refill/sample cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Reading files until the buffer holds a full batch.
    Refilling,
    /// Drawing and normalizing a batch from the buffer.
    Sampling,
    /// The file list is empty or yields no examples; every call fails.
    EmptyError,
}

/// Unbounded stream of `(predictors, targets)` batches over a file list.
#[derive(Debug)]
pub struct BatchGenerator<R> {
    reader: R,
    files: Vec<PathBuf>,
    cursor: usize,
    predictor_table: Arc<NormalizationTable>,
    target_table: Arc<NormalizationTable>,
    config: PipelineConfig,
    rng: SmallRng,
    chunks: Vec<ImageRecord>,
    buffered: usize,
    state: GeneratorState,
    last_draw: Vec<usize>,
    batches_emitted: u64,
    label: String,
    telemetry: Option<PipelineTelemetry>,
}

impl<R: ImageReader> BatchGenerator<R> {
    /// Creates a generator and shuffles `files` once.
    ///
    /// Both tables are mandatory and must cover every configured channel; a missing
    /// table or entry fails here rather than on the first batch.
    pub fn new(
        reader: R,
        files: Vec<PathBuf>,
        predictor_table: Option<Arc<NormalizationTable>>,
        target_table: Option<Arc<NormalizationTable>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let predictor_table = predictor_table.ok_or_else(|| {
            PipelineError::Configuration("predictor normalization table must be specified".into())
        })?;
        let target_table = target_table.ok_or_else(|| {
            PipelineError::Configuration("target normalization table must be specified".into())
        })?;
        for name in &config.predictor_names {
            predictor_table.entry(name)?.validate(name)?;
        }
        for name in &config.target_names {
            target_table.entry(name)?.validate(name)?;
        }

        let mut rng = config
            .seed
            .map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let mut files = files;
        files.shuffle(&mut rng);

        Ok(Self {
            reader,
            files,
            cursor: 0,
            predictor_table,
            target_table,
            config,
            rng,
            chunks: Vec::new(),
            buffered: 0,
            state: GeneratorState::Refilling,
            last_draw: Vec::new(),
            batches_emitted: 0,
            label: "generator".into(),
            telemetry: None,
        })
    }

    /// Names the generator in log records (`training`, `validation`).
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> GeneratorState {
        self.state
    }

    /// Examples currently held in the buffer.
    #[must_use]
    pub const fn buffered(&self) -> usize {
        self.buffered
    }

    /// Index into [`Self::file_order`] of the next file to read.
    #[must_use]
    pub const fn file_cursor(&self) -> usize {
        self.cursor
    }

    /// File order fixed by the construction-time shuffle.
    #[must_use]
    pub fn file_order(&self) -> &[PathBuf] {
        &self.files
    }

    /// Buffer indices drawn for the most recent batch.
    #[must_use]
    pub fn last_draw(&self) -> &[usize] {
        &self.last_draw
    }

    /// Batches produced so far.
    #[must_use]
    pub const fn batches_emitted(&self) -> u64 {
        self.batches_emitted
    }

    /// Predictor normalization table applied to every batch.
    #[must_use]
    pub fn predictor_table(&self) -> &NormalizationTable {
        &self.predictor_table
    }

    /// Target normalization table applied to every batch.
    #[must_use]
    pub fn target_table(&self) -> &NormalizationTable {
        &self.target_table
    }

    /// Configuration the generator was built with.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Produces the next batch, reading as many files as needed.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let batch_size = self.config.num_examples_per_batch;
        self.state = GeneratorState::Refilling;
        let mut reads_without_examples = 0;
        while self.buffered < batch_size {
            if self.refill_one()? == 0 {
                reads_without_examples += 1;
                if reads_without_examples >= self.files.len() {
                    self.state = GeneratorState::EmptyError;
                    let last_read = (self.cursor + self.files.len() - 1) % self.files.len();
                    return Err(PipelineError::file_format(
                        &self.files[last_read],
                        format!(
                            "{} generator read all {} files without finding any examples",
                            self.label,
                            self.files.len()
                        ),
                    ));
                }
            } else {
                reads_without_examples = 0;
            }
        }

        self.state = GeneratorState::Sampling;
        let batch = self.sample(batch_size);
        self.state = GeneratorState::Refilling;
        batch
    }

    fn refill_one(&mut self) -> Result<usize> {
        if self.files.is_empty() {
            self.state = GeneratorState::EmptyError;
            return Err(PipelineError::Configuration(format!(
                "{} generator has an empty file list",
                self.label
            )));
        }
        let path = &self.files[self.cursor];
        let record = self.reader.read(path, self.config.target_points.as_ref())?;
        if let Some(first) = self.chunks.first() {
            if first.predictors.shape()[1..] != record.predictors.shape()[1..]
                || first.targets.ncols() != record.targets.ncols()
            {
                return Err(PipelineError::file_format(
                    path,
                    format!(
                        "grid {:?} does not match buffered grid {:?}",
                        &record.predictors.shape()[1..],
                        &first.predictors.shape()[1..]
                    ),
                ));
            }
        }
        let examples = record.num_examples();
        emit(
            self.telemetry.as_ref(),
            LogLevel::Debug,
            "generator_file_read",
            json!({
                "generator": self.label,
                "path": path,
                "examples": examples,
                "buffered": self.buffered + examples,
            }),
        );
        self.cursor = (self.cursor + 1) % self.files.len();
        if examples > 0 {
            self.buffered += examples;
            self.chunks.push(record);
        }
        Ok(examples)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sample(&mut self, batch_size: usize) -> Result<Batch> {
        let chunks = std::mem::take(&mut self.chunks);
        let predictor_views: Vec<ArrayView4<'_, f64>> = chunks.iter().map(|c| c.predictors.view()).collect();
        let target_views: Vec<ArrayView2<'_, f64>> = chunks.iter().map(|c| c.targets.view()).collect();
        let all_predictors = concatenate(Axis(0), &predictor_views)
            .map_err(|err| PipelineError::Shape(err.to_string()))?;
        let all_targets = concatenate(Axis(0), &target_views)
            .map_err(|err| PipelineError::Shape(err.to_string()))?;

        let draw = index::sample(&mut self.rng, self.buffered, batch_size).into_vec();
        let predictors = all_predictors.select(Axis(0), &draw);
        let targets = all_targets.select(Axis(0), &draw);

        match self.config.leftover_policy {
            LeftoverPolicy::Discard => self.buffered = 0,
            LeftoverPolicy::Retain => {
                let mut taken = vec![false; self.buffered];
                for &index in &draw {
                    taken[index] = true;
                }
                let keep: Vec<usize> = (0..self.buffered).filter(|&index| !taken[index]).collect();
                self.buffered = keep.len();
                if !keep.is_empty() {
                    self.chunks.push(ImageRecord {
                        predictor_names: self.config.predictor_names.clone(),
                        predictors: all_predictors.select(Axis(0), &keep),
                        target_names: self.config.target_names.clone(),
                        targets: all_targets.select(Axis(0), &keep),
                    });
                }
            }
        }

        let predictors = normalize_predictors(predictors, &self.config.predictor_names, &self.predictor_table)?
            .mapv(|value| value as f32);
        let targets = normalize_targets(targets, &self.config.target_names, &self.target_table)?
            .mapv(|value| value as f32);

        self.last_draw = draw;
        self.batches_emitted += 1;
        emit(
            self.telemetry.as_ref(),
            LogLevel::Debug,
            "generator_batch_emitted",
            json!({
                "generator": self.label,
                "batch": self.batches_emitted,
                "examples": batch_size,
                "leftover": self.buffered,
            }),
        );
        Ok(Batch { predictors, targets })
    }
}

impl<R: ImageReader> Iterator for BatchGenerator<R> {
    type Item = Result<Batch>;

    /// Never returns `None`; the caller decides how many batches to take.
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{names, write_constant_file},
        normalization::NormalizationEntry,
        reader::NpzImageReader,
    };
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    fn config(batch: usize) -> PipelineConfig {
        PipelineConfig {
            predictor_names: names(&["u"]),
            target_names: names(&["obs"]),
            num_examples_per_batch: batch,
            seed: Some(42),
            ..PipelineConfig::default()
        }
    }

    fn identity() -> Arc<NormalizationTable> {
        Arc::new(NormalizationTable::from_entries([
            ("u", NormalizationEntry::ZScore { mean: 0.0, std: 1.0 }),
            ("obs", NormalizationEntry::ZScore { mean: 0.0, std: 1.0 }),
        ]))
    }

    /// Files whose examples carry unique values `file * 100 + example`.
    fn corpus(sizes: &[usize]) -> (TempDir, Vec<PathBuf>) {
        let dir = tempdir().unwrap();
        let paths = sizes
            .iter()
            .enumerate()
            .map(|(file, &size)| {
                let values: Vec<f64> = (0..size).map(|e| (file * 100 + e) as f64).collect();
                write_constant_file(dir.path(), &format!("f{file}.npz"), &values, &values)
            })
            .collect();
        (dir, paths)
    }

    fn generator(paths: Vec<PathBuf>, config: PipelineConfig) -> BatchGenerator<NpzImageReader> {
        BatchGenerator::new(NpzImageReader::new(&config), paths, Some(identity()), Some(identity()), config).unwrap()
    }

    #[test]
    fn missing_tables_fail_at_construction() {
        let config = config(4);
        let reader = NpzImageReader::new(&config);
        let err = BatchGenerator::new(&reader, vec![], None, Some(identity()), config.clone()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(ref m) if m.contains("predictor")));
        let err = BatchGenerator::new(&reader, vec![], Some(identity()), None, config.clone()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(ref m) if m.contains("target")));

        let partial = Arc::new(NormalizationTable::from_entries([(
            "obs",
            NormalizationEntry::ZScore { mean: 0.0, std: 1.0 },
        )]));
        let err = BatchGenerator::new(&reader, vec![], Some(partial), Some(identity()), config).unwrap_err();
        assert!(err.to_string().contains("\"u\""));
    }

    #[test]
    fn empty_file_list_fails_on_first_refill() {
        let mut generator = generator(vec![], config(2));
        assert!(matches!(generator.next_batch(), Err(PipelineError::Configuration(_))));
        assert_eq!(generator.state(), GeneratorState::EmptyError);
    }

    #[test]
    fn batches_have_requested_size_without_duplicates() {
        let (_dir, paths) = corpus(&[3, 5, 2, 7]);
        let mut generator = generator(paths, config(4));
        for batch in generator.by_ref().take(12) {
            let batch = batch.unwrap();
            assert_eq!(batch.len(), 4);
            assert_eq!(batch.predictors.shape(), &[4, 2, 2, 1]);
            assert_eq!(batch.targets.shape(), &[4, 4]);
            let ids: HashSet<i64> = batch.predictors.outer_iter().map(|ex| ex[[0, 0, 0]] as i64).collect();
            assert_eq!(ids.len(), 4);
            for (example, id) in batch.targets.outer_iter().zip(batch.predictors.outer_iter()) {
                assert_eq!(example[0], id[[0, 0, 0]]);
            }
        }
        let draw: HashSet<usize> = generator.last_draw().iter().copied().collect();
        assert_eq!(draw.len(), 4);
        assert_eq!(generator.batches_emitted(), 12);
        assert_eq!(generator.state(), GeneratorState::Refilling);
    }

    #[test]
    fn discards_leftovers_and_wraps_round_robin() {
        let (_dir, paths) = corpus(&[3, 3]);
        let mut generator = generator(paths, config(5));
        let order = generator.file_order().to_vec();

        generator.next_batch().unwrap();
        assert_eq!(generator.buffered(), 0);
        assert_eq!(generator.file_cursor(), 0);
        assert!(generator.last_draw().iter().all(|&index| index < 6));

        generator.next_batch().unwrap();
        assert_eq!(generator.file_order(), order.as_slice());
        assert_eq!(generator.file_cursor(), 0);
    }

    #[test]
    fn retain_policy_keeps_unsampled_examples() {
        let (_dir, paths) = corpus(&[3, 3, 3]);
        let mut retaining = config(4);
        retaining.leftover_policy = LeftoverPolicy::Retain;
        let mut generator = generator(paths, retaining);

        generator.next_batch().unwrap();
        assert_eq!(generator.buffered(), 2);
        assert_eq!(generator.file_cursor(), 2);
        generator.next_batch().unwrap();
        assert_eq!(generator.buffered(), 1);
        assert_eq!(generator.file_cursor(), 0);
    }

    #[test]
    fn applies_tables_and_casts() {
        let (_dir, paths) = corpus(&[6]);
        let config = config(6);
        let predictors = Arc::new(NormalizationTable::from_entries([(
            "u",
            NormalizationEntry::ZScore { mean: 2.0, std: 4.0 },
        )]));
        let targets = Arc::new(NormalizationTable::from_entries([(
            "obs",
            NormalizationEntry::MinMax { min: 0.0, max: 10.0 },
        )]));
        let mut generator =
            BatchGenerator::new(NpzImageReader::new(&config), paths, Some(predictors), Some(targets), config).unwrap();
        let batch = generator.next_batch().unwrap();
        let mut values: Vec<f32> = batch.predictors.iter().step_by(4).copied().collect();
        values.sort_by(f32::total_cmp);
        assert_eq!(values, vec![-0.5, -0.25, 0.0, 0.25, 0.5, 0.75]);
        let mut scaled: Vec<f32> = batch.targets.column(0).to_vec();
        scaled.sort_by(f32::total_cmp);
        assert_eq!(scaled, vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn same_seed_same_stream() {
        let (_dir, paths) = corpus(&[4, 4, 4]);
        let mut first = generator(paths.clone(), config(3));
        let mut second = generator(paths, config(3));
        assert_eq!(first.file_order(), second.file_order());
        for _ in 0..4 {
            assert_eq!(first.next_batch().unwrap().predictors, second.next_batch().unwrap().predictors);
        }
    }

    #[test]
    fn files_without_examples_do_not_spin() {
        let (_dir, paths) = corpus(&[0, 0]);
        let mut generator = generator(paths, config(1)).with_label("validation");
        let err = generator.next_batch().unwrap_err();
        let PipelineError::FileFormat { ref path, ref reason } = err else {
            panic!("expected a file format error, got {err:?}");
        };
        assert_eq!(path, &generator.file_order()[1]);
        assert!(reason.contains("validation generator read all 2 files"));
        assert_eq!(generator.state(), GeneratorState::EmptyError);
    }

    #[test]
    fn draws_from_the_whole_buffer_not_the_newest_file() {
        // the three-example file alone can fill a batch; the two-example file never can
        let (_dir, paths) = corpus(&[2, 3]);
        let mut generator = generator(paths, config(3));
        let mut drawn = HashSet::new();
        for _ in 0..50 {
            let batch = generator.next_batch().unwrap();
            drawn.extend(batch.predictors.outer_iter().map(|ex| ex[[0, 0, 0]] as i64));
        }
        let mut drawn: Vec<i64> = drawn.into_iter().collect();
        drawn.sort_unstable();
        assert_eq!(drawn, vec![0, 1, 100, 101, 102]);
    }
}
