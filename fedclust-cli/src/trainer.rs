//! Gradient-descent trainer for single-layer models
//!
//! Works on any [`Model`] whose parameters are `[weight (out, in), bias
//! (out)]`, which covers the simulation's `LinearModel` classifiers.

use fedclust_ai::{Model, ParameterVector, Tensor};
use fedclust_common::Device;
use fedclust_fl::{Batch, ClientError, DataLoader, EvalOutcome, LocalTrainer, TrainOptions};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use tracing::debug;

/// Softmax cross-entropy (classifier) and squared-error (regression) SGD
#[derive(Debug, Clone)]
pub struct SgdTrainer {
    learning_rate: f32,
}

impl Default for SgdTrainer {
    fn default() -> Self {
        Self { learning_rate: 0.1 }
    }
}

fn training_error(reason: impl std::fmt::Display) -> ClientError {
    ClientError::Training(reason.to_string())
}

fn linear_parts(params: ParameterVector) -> Result<(Array2<f32>, Array1<f32>), ClientError> {
    let mut tensors = params.into_tensors().into_iter();
    let (Some(weight), Some(bias), None) = (tensors.next(), tensors.next(), tensors.next()) else {
        return Err(training_error("expected [weight, bias] parameters"));
    };
    let weight = weight
        .to_array()?
        .into_dimensionality::<Ix2>()
        .map_err(training_error)?;
    let bias = bias
        .to_array()?
        .into_dimensionality::<Ix1>()
        .map_err(training_error)?;
    Ok((weight, bias))
}

fn inputs_matrix(batch: &Batch) -> Result<Array2<f32>, ClientError> {
    let rows = batch.len();
    let flat = batch.inputs.data().len() / rows.max(1);
    Array2::from_shape_vec((rows, flat), batch.inputs.data().to_vec()).map_err(training_error)
}

fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    probs
}

impl SgdTrainer {
    /// Trainer with a default learning rate
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    fn logits(model: &mut dyn Model, batch: &Batch) -> Result<Array2<f32>, ClientError> {
        model
            .forward(&batch.inputs)?
            .to_array()?
            .into_dimensionality::<Ix2>()
            .map_err(training_error)
    }

    /// One pass over `loader`, `grad` maps `(outputs, labels)` to dL/doutputs
    fn run_epochs(
        &self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        options: &TrainOptions,
        grad: impl Fn(&Array2<f32>, &[usize]) -> Array2<f32>,
    ) -> Result<(), ClientError> {
        let lr = options.learning_rate.unwrap_or(self.learning_rate);
        for epoch in 0..options.epochs {
            for batch in loader.batches()? {
                let outputs = Self::logits(model, &batch)?;
                let x = inputs_matrix(&batch)?;
                let d_out = grad(&outputs, &batch.labels) / batch.len() as f32;
                let (mut weight, mut bias) = linear_parts(model.get_parameters())?;
                weight.scaled_add(-lr, &d_out.t().dot(&x));
                bias.scaled_add(-lr, &d_out.sum_axis(Axis(0)));
                model.set_parameters(ParameterVector::new(vec![
                    Tensor::from(weight.into_dyn()),
                    Tensor::from(bias.into_dyn()),
                ]))?;
            }
            debug!("Epoch {} done on {}", epoch + 1, options.device);
        }
        Ok(())
    }
}

impl LocalTrainer for SgdTrainer {
    fn train_classifier(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        options: &TrainOptions,
    ) -> Result<(), ClientError> {
        self.run_epochs(model, loader, options, |logits, labels| {
            let mut d = softmax_rows(logits);
            for (mut row, &label) in d.axis_iter_mut(Axis(0)).zip(labels) {
                if let Some(p) = row.get_mut(label) {
                    *p -= 1.0;
                }
            }
            d
        })
    }

    fn train_regression(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        options: &TrainOptions,
    ) -> Result<(), ClientError> {
        self.run_epochs(model, loader, options, |outputs, labels| {
            let mut d = Array2::zeros(outputs.raw_dim());
            for (i, &label) in labels.iter().enumerate() {
                d[[i, 0]] = 2.0 * (outputs[[i, 0]] - label as f32);
            }
            d
        })
    }

    fn test_classifier(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        _device: &Device,
    ) -> Result<EvalOutcome, ClientError> {
        let (mut loss, mut correct, mut total) = (0.0f32, 0usize, 0usize);
        for batch in loader.batches()? {
            let probs = softmax_rows(&Self::logits(model, &batch)?);
            for (row, &label) in probs.axis_iter(Axis(0)).zip(&batch.labels) {
                loss -= row.get(label).copied().unwrap_or(0.0).max(1e-12).ln();
                let predicted = row
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i);
                correct += usize::from(predicted == Some(label));
                total += 1;
            }
        }
        let n = total.max(1) as f32;
        Ok(EvalOutcome {
            loss: loss / n,
            accuracy: correct as f32 / n,
        })
    }

    fn test_regression(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        _device: &Device,
    ) -> Result<EvalOutcome, ClientError> {
        let (mut loss, mut close, mut total) = (0.0f32, 0usize, 0usize);
        for batch in loader.batches()? {
            let outputs = Self::logits(model, &batch)?;
            for (i, &label) in batch.labels.iter().enumerate() {
                let err = outputs[[i, 0]] - label as f32;
                loss += err * err;
                close += usize::from(err.abs() < 0.5);
                total += 1;
            }
        }
        let n = total.max(1) as f32;
        Ok(EvalOutcome {
            loss: loss / n,
            accuracy: close as f32 / n,
        })
    }
}
