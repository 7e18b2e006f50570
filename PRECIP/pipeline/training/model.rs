use std::{fs, path::Path};

use anyhow::{bail, ensure, Context};
use ndarray::{Array1, Array2, ArrayD, ArrayView4, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::generator::Batch;

/// Trained-model capability used at inference time.
pub trait Model {
    /// Forward pass over `[example, row, column, channel]` predictors; axis 0 of the
    /// output is the example axis.
    fn predict(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>>;

    /// A view sharing this model's input whose output is the named layer's output.
    fn feature_view(&self, layer: &str) -> anyhow::Result<Box<dyn Model + '_>>;
}

/// Model that can be driven by the training orchestrator.
pub trait TrainableModel: Model {
    /// One optimization step; returns the batch loss.
    fn train_on_batch(&mut self, batch: &Batch) -> anyhow::Result<f32>;

    /// Loss on a batch without updating weights.
    fn evaluate_on_batch(&self, batch: &Batch) -> anyhow::Result<f32>;

    /// Writes the model artifact.
    fn save(&self, path: &Path) -> anyhow::Result<()>;
}

/// Name of the [`DenseRegressor`] layer exposing flattened inputs.
pub const FLATTEN_LAYER: &str = "flatten";

/// Linear baseline mapping flattened predictor grids to flattened targets.
#[derive(Debug, Clone)]
pub struct DenseRegressor {
    weights: Array2<f32>,
    bias: Array1<f32>,
    learning_rate: f32,
}

#[derive(Serialize, Deserialize)]
struct DenseWeights {
    input_dim: usize,
    output_dim: usize,
    learning_rate: f32,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl DenseRegressor {
    /// Creates a regressor with small random weights.
    #[must_use]
    pub fn new(input_dim: usize, output_dim: usize, learning_rate: f32, seed: Option<u64>) -> Self {
        let mut rng = seed.map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        let weights = Array2::from_shape_fn((input_dim, output_dim), |_| rng.gen_range(-0.01..0.01));
        Self {
            weights,
            bias: Array1::zeros(output_dim),
            learning_rate,
        }
    }

    /// Loads weights written by [`TrainableModel::save`].
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path.as_ref()))?;
        let dense: DenseWeights = serde_json::from_str(&contents).context("parsing dense weights file")?;
        ensure!(
            dense.weights.len() == dense.input_dim * dense.output_dim && dense.bias.len() == dense.output_dim,
            "dense weight length mismatch"
        );
        let weights = Array2::from_shape_vec((dense.input_dim, dense.output_dim), dense.weights)
            .context("building weight matrix")?;
        Ok(Self {
            weights,
            bias: Array1::from(dense.bias),
            learning_rate: dense.learning_rate,
        })
    }

    /// `(input_dim, output_dim)`.
    #[must_use]
    pub fn dims(&self) -> (usize, usize) {
        self.weights.dim()
    }

    fn linear(&self, inputs: &Array2<f32>) -> Array2<f32> {
        inputs.dot(&self.weights) + &self.bias
    }

    fn inputs(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let inputs = flatten(batch)?;
        ensure!(
            inputs.ncols() == self.weights.nrows(),
            "expected {} input features, got {}",
            self.weights.nrows(),
            inputs.ncols()
        );
        Ok(inputs)
    }

    #[allow(clippy::cast_precision_loss)]
    fn residuals(&self, batch: &Batch) -> anyhow::Result<(Array2<f32>, Array2<f32>, f32)> {
        let inputs = self.inputs(batch.predictors.view())?;
        ensure!(
            batch.targets.dim() == (inputs.nrows(), self.weights.ncols()),
            "target batch shape {:?} does not match model output {:?}",
            batch.targets.dim(),
            (inputs.nrows(), self.weights.ncols())
        );
        let residuals = self.linear(&inputs) - &batch.targets;
        let loss = residuals.mapv(|value| value * value).sum() / residuals.len().max(1) as f32;
        Ok((inputs, residuals, loss))
    }
}

fn flatten(batch: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
    let (examples, rows, cols, channels) = batch.dim();
    let flat = batch
        .to_shape((examples, rows * cols * channels))
        .context("flattening predictor batch")?;
    Ok(flat.into_owned())
}

impl Model for DenseRegressor {
    fn predict(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>> {
        let inputs = self.inputs(batch)?;
        Ok(self.linear(&inputs).into_dyn())
    }

    fn feature_view(&self, layer: &str) -> anyhow::Result<Box<dyn Model + '_>> {
        match layer {
            FLATTEN_LAYER => Ok(Box::new(FlattenView)),
            other => bail!("dense regressor has no layer named \"{other}\""),
        }
    }
}

impl TrainableModel for DenseRegressor {
    #[allow(clippy::cast_precision_loss)]
    fn train_on_batch(&mut self, batch: &Batch) -> anyhow::Result<f32> {
        let (inputs, residuals, loss) = self.residuals(batch)?;
        let scale = 2.0 / residuals.len().max(1) as f32;
        let weight_grad = inputs.t().dot(&residuals) * scale;
        let bias_grad = residuals.sum_axis(Axis(0)) * scale;
        self.weights.scaled_add(-self.learning_rate, &weight_grad);
        self.bias.scaled_add(-self.learning_rate, &bias_grad);
        Ok(loss)
    }

    fn evaluate_on_batch(&self, batch: &Batch) -> anyhow::Result<f32> {
        Ok(self.residuals(batch)?.2)
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating model dir {}", parent.display()))?;
        }
        let (input_dim, output_dim) = self.dims();
        let dense = DenseWeights {
            input_dim,
            output_dim,
            learning_rate: self.learning_rate,
            weights: self.weights.iter().copied().collect(),
            bias: self.bias.to_vec(),
        };
        fs::write(path, serde_json::to_string(&dense)?).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Feature view returning each example's flattened predictor grid.
struct FlattenView;

impl Model for FlattenView {
    fn predict(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>> {
        Ok(flatten(batch)?.into_dyn())
    }

    fn feature_view(&self, layer: &str) -> anyhow::Result<Box<dyn Model + '_>> {
        bail!("feature view has no nested layer \"{layer}\"")
    }
}
