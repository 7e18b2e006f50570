use std::{
    fs::File,
    path::{Path, PathBuf},
};

use ndarray::Array3;
use ndarray_npy::NpzWriter;

use crate::config::ChannelName;

pub fn names(items: &[&str]) -> Vec<ChannelName> {
    items.iter().map(|&item| item.to_owned()).collect()
}

/// Writes one `.npz` source file with the given predictor and target variables.
pub fn write_image_file(
    dir: &Path,
    file_name: &str,
    predictors: &[(&str, &Array3<f64>)],
    targets: &[(&str, &Array3<f64>)],
) -> PathBuf {
    let path = dir.join(file_name);
    let mut npz = NpzWriter::new(File::create(&path).unwrap());
    for (name, values) in predictors.iter().chain(targets) {
        npz.add_array(*name, *values).unwrap();
    }
    npz.finish().unwrap();
    path
}

/// Writes a single-predictor (`u`), single-target (`obs`) file whose examples
/// hold the given constants on a 2x2 grid.
pub fn write_constant_file(dir: &Path, file_name: &str, predictor: &[f64], target: &[f64]) -> PathBuf {
    let u = Array3::from_shape_fn((predictor.len(), 2, 2), |(e, _, _)| predictor[e]);
    let obs = Array3::from_shape_fn((target.len(), 2, 2), |(e, _, _)| target[e]);
    write_image_file(dir, file_name, &[("u", &u)], &[("obs", &obs)])
}
