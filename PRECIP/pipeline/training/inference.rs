use anyhow::{ensure, Context};
use ndarray::{concatenate, s, Array2, ArrayD, ArrayView4, Axis, IxDyn};
use serde_json::json;
use shared_logging::LogLevel;

use super::model::Model;
use crate::{
    config::{ChannelName, DEFAULT_INFERENCE_BATCH_SIZE},
    normalization::{denormalize_targets, NormalizationTable},
    telemetry::{emit, PipelineTelemetry},
};

/// Controls for [`apply_model`].
#[derive(Debug, Clone, Copy)]
pub struct InferenceOptions<'a> {
    /// Examples per forward pass.
    pub batch_size: usize,
    /// Layer whose output is returned instead of the model output.
    pub output_layer: Option<&'a str>,
    /// Progress sink.
    pub telemetry: Option<&'a PipelineTelemetry>,
}

impl Default for InferenceOptions<'_> {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_INFERENCE_BATCH_SIZE,
            output_layer: None,
            telemetry: None,
        }
    }
}

/// Runs `model` over already-normalized predictors in sub-batches and concatenates the
/// outputs along the example axis.
///
/// Empty input yields an empty one-dimensional array without calling the model.
pub fn apply_model(
    model: &dyn Model,
    predictors: ArrayView4<'_, f32>,
    options: &InferenceOptions<'_>,
) -> anyhow::Result<ArrayD<f32>> {
    ensure!(options.batch_size > 0, "inference batch size must be positive");
    let num_examples = predictors.len_of(Axis(0));
    if num_examples == 0 {
        return Ok(ArrayD::zeros(IxDyn(&[0])));
    }

    let feature_view;
    let active: &dyn Model = match options.output_layer {
        Some(layer) => {
            feature_view = model
                .feature_view(layer)
                .with_context(|| format!("resolving output layer {layer}"))?;
            feature_view.as_ref()
        }
        None => model,
    };

    let mut outputs = Vec::with_capacity(num_examples.div_ceil(options.batch_size));
    for first in (0..num_examples).step_by(options.batch_size) {
        let last = (first + options.batch_size).min(num_examples);
        emit(
            options.telemetry,
            LogLevel::Debug,
            "inference_sub_batch",
            json!({ "first": first + 1, "last": last, "total": num_examples }),
        );
        let output = active
            .predict(predictors.slice(s![first..last, .., .., ..]))
            .with_context(|| format!("predicting examples {first}..{last}"))?;
        ensure!(
            output.ndim() > 0 && output.len_of(Axis(0)) == last - first,
            "model returned {:?} for {} examples",
            output.shape(),
            last - first
        );
        outputs.push(output);
    }

    let views: Vec<_> = outputs.iter().map(ArrayD::view).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Maps `[example, target * spatial]` model output back to physical units.
pub fn denormalize_predictions(
    output: &ArrayD<f32>,
    target_names: &[ChannelName],
    table: &NormalizationTable,
) -> anyhow::Result<Array2<f64>> {
    let output = output
        .view()
        .into_dimensionality::<ndarray::Ix2>()
        .context("predictions must be two-dimensional")?;
    Ok(denormalize_targets(output.mapv(f64::from), target_names, table)?)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{config::Scheme, normalization::NormalizationEntry};
    use anyhow::bail;
    use ndarray::{Array4, ArrayView4};

    /// Sums each example's grid and records sub-batch sizes.
    #[derive(Default)]
    struct SumModel {
        calls: RefCell<Vec<usize>>,
    }

    impl Model for SumModel {
        fn predict(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>> {
            self.calls.borrow_mut().push(batch.len_of(Axis(0)));
            let sums: Vec<f32> = batch.outer_iter().map(|example| example.sum()).collect();
            Ok(Array2::from_shape_vec((sums.len(), 1), sums)?.into_dyn())
        }

        fn feature_view(&self, layer: &str) -> anyhow::Result<Box<dyn Model + '_>> {
            if layer == "identity" {
                Ok(Box::new(IdentityView))
            } else {
                bail!("no layer {layer}")
            }
        }
    }

    struct IdentityView;

    impl Model for IdentityView {
        fn predict(&self, batch: ArrayView4<'_, f32>) -> anyhow::Result<ArrayD<f32>> {
            Ok(batch.to_owned().into_dyn())
        }

        fn feature_view(&self, layer: &str) -> anyhow::Result<Box<dyn Model + '_>> {
            bail!("no layer {layer}")
        }
    }

    fn predictors(examples: usize) -> Array4<f32> {
        Array4::from_shape_fn((examples, 2, 2, 1), |(e, ..)| e as f32)
    }

    #[test]
    fn splits_into_sub_batches_and_preserves_order() {
        let model = SumModel::default();
        let options = InferenceOptions {
            batch_size: 1000,
            ..InferenceOptions::default()
        };
        let output = apply_model(&model, predictors(2500).view(), &options).unwrap();
        assert_eq!(*model.calls.borrow(), vec![1000, 1000, 500]);
        assert_eq!(output.shape(), &[2500, 1]);
        assert!((output[[2499, 0]] - 2499.0 * 4.0).abs() < 1e-3);
        assert!((output[[1000, 0]] - 4000.0).abs() < 1e-3);
    }

    #[test]
    fn empty_input_skips_the_model() {
        let model = SumModel::default();
        let output = apply_model(&model, predictors(0).view(), &InferenceOptions::default()).unwrap();
        assert_eq!(output.len(), 0);
        assert!(model.calls.borrow().is_empty());
    }

    #[test]
    fn output_layer_selects_feature_view() {
        let model = SumModel::default();
        let options = InferenceOptions {
            batch_size: 3,
            output_layer: Some("identity"),
            telemetry: None,
        };
        let output = apply_model(&model, predictors(7).view(), &options).unwrap();
        assert_eq!(output.shape(), &[7, 2, 2, 1]);
        let missing = InferenceOptions {
            output_layer: Some("dense_9"),
            ..options
        };
        assert!(apply_model(&model, predictors(7).view(), &missing).is_err());
    }

    #[test]
    fn predictions_are_denormalized_per_target() {
        let table = NormalizationTable::from_entries([(
            "obs".to_string(),
            NormalizationEntry::ZScore { mean: 10.0, std: 2.0 },
        )]);
        let output = Array2::from_shape_vec((2, 1), vec![0.0_f32, 2.0]).unwrap().into_dyn();
        let physical = denormalize_predictions(&output, &["obs".to_string()], &table).unwrap();
        assert!((physical[[0, 0]] - 10.0).abs() < 1e-9);
        assert!((physical[[1, 0]] - 14.0).abs() < 1e-9);
        assert_eq!(table.get("obs").map(NormalizationEntry::scheme), Some(Scheme::ZScore));
    }
}
