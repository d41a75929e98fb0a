//! Mock local trainer
//!
//! Training adds `step` to every weight. Evaluation reports the squared
//! distance between the model's last tensor and a target, so tests can
//! control which IFCA cluster looks best.

use std::sync::{Arc, Mutex};

use fedclust_ai::{Model, ModelError, ParameterVector, Tensor};
use fedclust_common::Device;
use fedclust_fl::{ClientError, DataLoader, EvalOutcome, LocalTrainer, TrainOptions};

/// Calls observed by a [`MockTrainer`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainerStats {
    /// Training calls
    pub trained: usize,
    /// Evaluation calls
    pub tested: usize,
    /// Samples seen by training
    pub samples_trained: usize,
    /// Losses returned, in order
    pub losses: Vec<f32>,
}

/// Deterministic trainer shared with the test through [`MockTrainer::stats`]
#[derive(Debug, Clone, Default)]
pub struct MockTrainer {
    step: f32,
    target: Vec<f32>,
    stats: Arc<Mutex<TrainerStats>>,
}

impl MockTrainer {
    pub fn new() -> Self {
        Self {
            step: 1.0,
            ..Self::default()
        }
    }

    /// Target the last tensor is compared against
    pub fn with_target(mut self, target: Vec<f32>) -> Self {
        self.target = target;
        self
    }

    pub fn with_step(mut self, step: f32) -> Self {
        self.step = step;
        self
    }

    /// Handle to the recorded calls
    pub fn stats(&self) -> Arc<Mutex<TrainerStats>> {
        Arc::clone(&self.stats)
    }

    fn train(&mut self, model: &mut dyn Model, loader: &mut dyn DataLoader) -> Result<(), ClientError> {
        let step = self.step;
        let params: Vec<Tensor> = model
            .get_parameters()
            .into_iter()
            .map(|t| {
                let shape = t.shape().clone();
                let data = t.into_data().into_iter().map(|v| v + step).collect();
                Tensor::new(data, shape)
            })
            .collect::<Result<_, ModelError>>()?;
        model.set_parameters(ParameterVector::new(params))?;
        if let Ok(mut stats) = self.stats.lock() {
            stats.trained += 1;
            stats.samples_trained += loader.num_samples();
        }
        Ok(())
    }

    fn test(&mut self, model: &mut dyn Model) -> EvalOutcome {
        let params = model.get_parameters();
        let last = params.tensors().last().map(|t| t.data().to_vec()).unwrap_or_default();
        let loss = last
            .iter()
            .zip(self.target.iter().chain(std::iter::repeat(&0.0)))
            .map(|(v, t)| (v - t) * (v - t))
            .sum::<f32>();
        if let Ok(mut stats) = self.stats.lock() {
            stats.tested += 1;
            stats.losses.push(loss);
        }
        EvalOutcome {
            loss,
            accuracy: 1.0 / (1.0 + loss),
        }
    }
}

impl LocalTrainer for MockTrainer {
    fn train_classifier(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        _options: &TrainOptions,
    ) -> Result<(), ClientError> {
        self.train(model, loader)
    }

    fn train_regression(
        &mut self,
        model: &mut dyn Model,
        loader: &mut dyn DataLoader,
        _options: &TrainOptions,
    ) -> Result<(), ClientError> {
        self.train(model, loader)
    }

    fn test_classifier(
        &mut self,
        model: &mut dyn Model,
        _loader: &mut dyn DataLoader,
        _device: &Device,
    ) -> Result<EvalOutcome, ClientError> {
        Ok(self.test(model))
    }

    fn test_regression(
        &mut self,
        model: &mut dyn Model,
        _loader: &mut dyn DataLoader,
        _device: &Device,
    ) -> Result<EvalOutcome, ClientError> {
        Ok(self.test(model))
    }
}
