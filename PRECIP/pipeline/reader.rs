//! Single-file image reading: predictor stacking, NaN scrubbing, target flattening.
//!
//! Every source file holds one 3-D variable `[example, row, column]` per predictor and
//! per target. A read produces an [`ImageRecord`] with predictors stacked on a trailing
//! channel axis and targets flattened to `[example, spatial]`.

use std::{
    collections::HashSet,
    fs::File,
    path::{Path, PathBuf},
};

use ndarray::{concatenate, stack, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Ix3, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;

use crate::{
    config::{ChannelName, PipelineConfig, TargetPoints},
    error::{PipelineError, Result},
};

/// Contents of one source file after assembly.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Predictor names in channel-axis order.
    pub predictor_names: Vec<ChannelName>,
    /// `[example, row, column, channel]` predictor values with NaN replaced by zero.
    pub predictors: Array4<f64>,
    /// Target names in block order.
    pub target_names: Vec<ChannelName>,
    /// `[example, target * spatial]` target values, one column block per target.
    pub targets: Array2<f64>,
}

impl ImageRecord {
    /// Stacks raw per-variable fields into a record.
    ///
    /// Fails when example-axis lengths or predictor grid shapes disagree, or when a
    /// target point lies outside the target grid.
    pub fn assemble(
        path: &Path,
        predictor_names: &[ChannelName],
        predictor_fields: &[Array3<f64>],
        target_names: &[ChannelName],
        target_fields: &[Array3<f64>],
        points: Option<&TargetPoints>,
    ) -> Result<Self> {
        let first = predictor_fields
            .first()
            .ok_or_else(|| PipelineError::file_format(path, "no predictor variables"))?;
        let grid = first.dim();
        for (name, field) in predictor_names.iter().zip(predictor_fields) {
            if field.dim() != grid {
                return Err(PipelineError::file_format(
                    path,
                    format!(
                        "predictor \"{name}\" has shape {:?}, expected {:?}",
                        field.shape(),
                        [grid.0, grid.1, grid.2]
                    ),
                ));
            }
        }
        let views: Vec<ArrayView3<'_, f64>> = predictor_fields.iter().map(Array3::view).collect();
        let mut predictors = stack(Axis(3), &views)
            .map_err(|err| PipelineError::file_format(path, err.to_string()))?;
        predictors.mapv_inplace(|value| if value.is_nan() { 0.0 } else { value });

        let num_examples = grid.0;
        let mut blocks = Vec::with_capacity(target_fields.len());
        for (name, field) in target_names.iter().zip(target_fields) {
            if field.len_of(Axis(0)) != num_examples {
                return Err(PipelineError::file_format(
                    path,
                    format!(
                        "target \"{name}\" has {} examples, predictors have {num_examples}",
                        field.len_of(Axis(0))
                    ),
                ));
            }
            blocks.push(flatten_target(path, name, field, points)?);
        }
        if let Some(width) = blocks.first().map(Array2::ncols) {
            if blocks.iter().any(|block| block.ncols() != width) {
                return Err(PipelineError::file_format(
                    path,
                    "target variables flatten to different spatial sizes",
                ));
            }
        }
        let block_views: Vec<ArrayView2<'_, f64>> = blocks.iter().map(Array2::view).collect();
        let targets = concatenate(Axis(1), &block_views)
            .map_err(|err| PipelineError::file_format(path, err.to_string()))?;

        Ok(Self {
            predictor_names: predictor_names.to_vec(),
            predictors,
            target_names: target_names.to_vec(),
            targets,
        })
    }

    /// Length of the example axis shared by predictors and targets.
    #[must_use]
    pub fn num_examples(&self) -> usize {
        self.predictors.len_of(Axis(0))
    }

    /// Number of target columns belonging to each target name.
    #[must_use]
    pub fn target_block_width(&self) -> usize {
        self.targets.ncols() / self.target_names.len().max(1)
    }
}

fn flatten_target(
    path: &Path,
    name: &str,
    field: &Array3<f64>,
    points: Option<&TargetPoints>,
) -> Result<Array2<f64>> {
    let (examples, rows, cols) = field.dim();
    match points {
        None => Array2::from_shape_vec((examples, rows * cols), field.iter().copied().collect())
            .map_err(|err| PipelineError::file_format(path, err.to_string())),
        Some(points) => {
            let selected: Vec<(usize, usize)> = points.iter().collect();
            if let Some(&(row, col)) = selected.iter().find(|&&(r, c)| r >= rows || c >= cols) {
                return Err(PipelineError::file_format(
                    path,
                    format!("target point ({row}, {col}) outside {rows}x{cols} grid of \"{name}\""),
                ));
            }
            Ok(Array2::from_shape_fn((examples, selected.len()), |(example, point)| {
                let (row, col) = selected[point];
                field[[example, row, col]]
            }))
        }
    }
}

/// Reads one source file into an [`ImageRecord`].
pub trait ImageReader {
    /// Reads `path`, subsetting targets to `points` when given.
    fn read(&self, path: &Path, points: Option<&TargetPoints>) -> Result<ImageRecord>;
}

impl<R: ImageReader + ?Sized> ImageReader for &R {
    fn read(&self, path: &Path, points: Option<&TargetPoints>) -> Result<ImageRecord> {
        (**self).read(path, points)
    }
}

/// Reader for `.npz` archives holding one named array per variable.
#[derive(Debug, Clone)]
pub struct NpzImageReader {
    predictor_names: Vec<ChannelName>,
    target_names: Vec<ChannelName>,
}

impl NpzImageReader {
    /// Creates a reader for the variables named in `config`.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            predictor_names: config.predictor_names.clone(),
            target_names: config.target_names.clone(),
        }
    }
}

impl ImageReader for NpzImageReader {
    fn read(&self, path: &Path, points: Option<&TargetPoints>) -> Result<ImageRecord> {
        let file = File::open(path).map_err(|err| PipelineError::file_format(path, err.to_string()))?;
        let mut npz =
            NpzReader::new(file).map_err(|err| PipelineError::file_format(path, err.to_string()))?;
        let available: HashSet<String> = npz
            .names()
            .map_err(|err| PipelineError::file_format(path, err.to_string()))?
            .into_iter()
            .map(|name| name.strip_suffix(".npy").map_or_else(|| name.clone(), ToOwned::to_owned))
            .collect();

        let mut predictor_fields = Vec::with_capacity(self.predictor_names.len());
        for name in &self.predictor_names {
            predictor_fields.push(read_npz_variable(&mut npz, &available, path, name)?);
        }
        let mut target_fields = Vec::with_capacity(self.target_names.len());
        for name in &self.target_names {
            target_fields.push(read_npz_variable(&mut npz, &available, path, name)?);
        }
        ImageRecord::assemble(
            path,
            &self.predictor_names,
            &predictor_fields,
            &self.target_names,
            &target_fields,
            points,
        )
    }
}

fn read_npz_variable(
    npz: &mut NpzReader<File>,
    available: &HashSet<String>,
    path: &Path,
    name: &str,
) -> Result<Array3<f64>> {
    if !available.contains(name) {
        return Err(PipelineError::file_format(
            path,
            format!("missing required variable \"{name}\""),
        ));
    }
    let values = match npz.by_name::<OwnedRepr<f64>, IxDyn>(name) {
        Ok(values) => values,
        Err(wide_err) => npz
            .by_name::<OwnedRepr<f32>, IxDyn>(name)
            .map(|narrow| narrow.mapv(f64::from))
            .map_err(|_| PipelineError::file_format(path, format!("variable \"{name}\": {wide_err}")))?,
    };
    let shape = values.shape().to_vec();
    values.into_dimensionality::<Ix3>().map_err(|_| {
        PipelineError::file_format(
            path,
            format!("variable \"{name}\" has shape {shape:?}, expected [example, row, column]"),
        )
    })
}

/// Sums the example-axis length over a corpus, reading each file once.
pub fn count_examples<R: ImageReader>(
    reader: &R,
    paths: &[PathBuf],
    points: Option<&TargetPoints>,
) -> Result<usize> {
    let mut total = 0;
    for path in paths {
        total += reader.read(path, points)?.num_examples();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{names, write_image_file};
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn stacks_channels_and_scrubs_nan() {
        let dir = tempdir().unwrap();
        let mut u = Array3::from_shape_fn((2, 3, 4), |(e, r, c)| (e * 100 + r * 10 + c) as f64);
        u[[0, 1, 1]] = f64::NAN;
        u[[1, 2, 3]] = f64::NAN;
        let v = Array3::from_elem((2, 3, 4), -1.5);
        let target = Array3::from_shape_fn((2, 3, 4), |(e, r, c)| (e + r + c) as f64);
        let path = write_image_file(dir.path(), "a.npz", &[("u", &u), ("v", &v)], &[("obs", &target)]);

        let config = PipelineConfig {
            predictor_names: names(&["u", "v"]),
            target_names: names(&["obs"]),
            ..PipelineConfig::default()
        };
        let record = NpzImageReader::new(&config).read(&path, None).unwrap();

        assert_eq!(record.predictors.shape(), &[2, 3, 4, 2]);
        assert_eq!(record.predictors[[0, 1, 1, 0]], 0.0);
        assert_eq!(record.predictors[[1, 2, 3, 0]], 0.0);
        assert_eq!(record.predictors[[1, 0, 2, 0]], 102.0);
        assert!(record.predictors.iter().all(|value| !value.is_nan()));
        assert!(record.predictors.index_axis(Axis(3), 1).iter().all(|&value| value == -1.5));
        assert_eq!(record.targets.shape(), &[2, 12]);
        assert_eq!(record.targets[[1, 4 + 2]], 1.0 + 1.0 + 2.0);
    }

    #[test]
    fn selects_paired_target_points() {
        let dir = tempdir().unwrap();
        let u = Array3::zeros((3, 4, 5));
        let target = Array3::from_shape_fn((3, 4, 5), |(e, r, c)| (e * 1000 + r * 10 + c) as f64);
        let path = write_image_file(dir.path(), "b.npz", &[("u", &u)], &[("obs", &target)]);
        let config = PipelineConfig {
            predictor_names: names(&["u"]),
            target_names: names(&["obs"]),
            ..PipelineConfig::default()
        };
        let points = TargetPoints::new(vec![0, 3, 2], vec![4, 1, 2]).unwrap();
        let record = NpzImageReader::new(&config).read(&path, Some(&points)).unwrap();
        assert_eq!(record.targets.shape(), &[3, 3]);
        assert_eq!(record.targets.row(2).to_vec(), vec![2004.0, 2031.0, 2022.0]);

        let outside = TargetPoints::new(vec![4], vec![0]).unwrap();
        let err = NpzImageReader::new(&config).read(&path, Some(&outside)).unwrap_err();
        assert!(matches!(err, PipelineError::FileFormat { .. }));
    }

    #[test]
    fn missing_variable_names_channel_and_path() {
        let dir = tempdir().unwrap();
        let u = Array3::zeros((1, 2, 2));
        let path = write_image_file(dir.path(), "c.npz", &[("u", &u)], &[("obs", &u)]);
        let config = PipelineConfig {
            predictor_names: names(&["u", "t2m"]),
            target_names: names(&["obs"]),
            ..PipelineConfig::default()
        };
        let err = NpzImageReader::new(&config).read(&path, None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("t2m"));
        assert!(message.contains("c.npz"));
    }

    #[test]
    fn unreadable_path_is_file_format_error() {
        let config = PipelineConfig::default();
        let err = NpzImageReader::new(&config)
            .read(Path::new("/nonexistent/input.npz"), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::FileFormat { .. }));
    }

    #[test]
    fn counts_examples_across_files() {
        let dir = tempdir().unwrap();
        let a = Array3::zeros((3, 2, 2));
        let b = Array3::zeros((5, 2, 2));
        let first = write_image_file(dir.path(), "a.npz", &[("u", &a)], &[("obs", &a)]);
        let second = write_image_file(dir.path(), "b.npz", &[("u", &b)], &[("obs", &b)]);
        let config = PipelineConfig {
            predictor_names: names(&["u"]),
            target_names: names(&["obs"]),
            ..PipelineConfig::default()
        };
        let reader = NpzImageReader::new(&config);
        assert_eq!(count_examples(&reader, &[first, second], None).unwrap(), 8);
    }

    #[test]
    fn mismatched_example_axis_is_rejected() {
        let u = Array3::zeros((3, 2, 2));
        let target = Array3::zeros((2, 2, 2));
        let err = ImageRecord::assemble(
            Path::new("mem"),
            &names(&["u"]),
            &[u],
            &names(&["obs"]),
            &[target],
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("obs"));
    }
}
