//! NetCDF source files, one `[time, row, column]` variable per channel.

use std::path::Path;

use ndarray::Array3;

use crate::{
    config::{ChannelName, PipelineConfig, TargetPoints},
    error::{PipelineError, Result},
    reader::{ImageReader, ImageRecord},
};

/// Reader for NetCDF files holding the configured predictor and target variables.
#[derive(Debug, Clone)]
pub struct NetcdfImageReader {
    predictor_names: Vec<ChannelName>,
    target_names: Vec<ChannelName>,
}

impl NetcdfImageReader {
    /// Creates a reader for the variables named in `config`.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            predictor_names: config.predictor_names.clone(),
            target_names: config.target_names.clone(),
        }
    }
}

impl ImageReader for NetcdfImageReader {
    fn read(&self, path: &Path, points: Option<&TargetPoints>) -> Result<ImageRecord> {
        let file = netcdf::open(path).map_err(|err| PipelineError::file_format(path, err.to_string()))?;
        let load = |names: &[ChannelName]| -> Result<Vec<Array3<f64>>> {
            names
                .iter()
                .map(|name| read_netcdf_variable(&file, path, name))
                .collect()
        };
        let predictor_fields = load(&self.predictor_names)?;
        let target_fields = load(&self.target_names)?;
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

fn read_netcdf_variable(file: &netcdf::File, path: &Path, name: &str) -> Result<Array3<f64>> {
    let variable = file
        .variable(name)
        .ok_or_else(|| PipelineError::file_format(path, format!("missing required variable \"{name}\"")))?;
    let dims: Vec<usize> = variable.dimensions().iter().map(netcdf::Dimension::len).collect();
    let &[examples, rows, cols] = dims.as_slice() else {
        return Err(PipelineError::file_format(
            path,
            format!("variable \"{name}\" has dimensions {dims:?}, expected [time, row, column]"),
        ));
    };
    let values = variable
        .get_values::<f64, _>(..)
        .map_err(|err| PipelineError::file_format(path, format!("variable \"{name}\": {err}")))?;
    Array3::from_shape_vec((examples, rows, cols), values)
        .map_err(|err| PipelineError::file_format(path, format!("variable \"{name}\": {err}")))
}
