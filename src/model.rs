//! Linear classifier backend on candle: local datasets, one-epoch training and validation.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{loss, ops, Linear, Module, Optimizer, SGD};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};
use crate::params::{ParameterSet, TensorData};
use crate::types::Accuracy;

/// Confidence thresholds averaged into `map50_95`.
const THRESHOLDS: [f32; 10] = [0.50, 0.55, 0.60, 0.65, 0.70, 0.75, 0.80, 0.85, 0.90, 0.95];

pub fn default_device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDataset {
    pub dim: usize,
    pub classes: usize,
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<u32>,
}

impl LocalDataset {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| FlError::Dataset(format!("{}: {e}", path.display())))?;
        let ds: Self = serde_json::from_slice(&bytes).map_err(|e| FlError::Dataset(format!("{}: {e}", path.display())))?;
        ds.validate()?;
        Ok(ds)
    }

    /// Noisy samples scattered around one random centre per class.
    pub fn synthetic(seed: u64, samples: usize, dim: usize, classes: usize, spread: f32) -> Self {
        let mut centres_rng = StdRng::seed_from_u64(0x5eed);
        let centres: Vec<Vec<f32>> =
            (0..classes).map(|_| (0..dim).map(|_| centres_rng.gen_range(-1.0f32..1.0)).collect()).collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Vec::with_capacity(samples);
        let mut labels = Vec::with_capacity(samples);
        for i in 0..samples {
            let label = i % classes;
            let x = centres[label].iter().map(|c| c + rng.gen_range(-spread..=spread)).collect();
            features.push(x);
            labels.push(label as u32);
        }
        Self { dim, classes, features, labels }
    }

    /// Same features with every label shifted to the next class.
    pub fn with_shifted_labels(&self) -> Self {
        let labels = self.labels.iter().map(|l| (l + 1) % self.classes as u32).collect();
        Self { labels, ..self.clone() }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.features.len() != self.labels.len() {
            return Err(FlError::Dataset(format!(
                "{} feature rows but {} labels",
                self.features.len(),
                self.labels.len()
            )));
        }
        if let Some(row) = self.features.iter().position(|f| f.len() != self.dim) {
            return Err(FlError::Dataset(format!("row {row} does not have {} features", self.dim)));
        }
        if let Some(row) = self.labels.iter().position(|&l| l as usize >= self.classes) {
            return Err(FlError::Dataset(format!("label at row {row} is outside 0..{}", self.classes)));
        }
        Ok(())
    }

    fn tensors(&self, dev: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let flat: Vec<f32> = self.features.iter().flatten().copied().collect();
        let xs = Tensor::from_vec(flat, (self.len(), self.dim), dev)?;
        let ys = Tensor::from_vec(self.labels.clone(), self.len(), dev)?;
        Ok((xs, ys))
    }
}

/// Initial global weights: uniform in +-1/sqrt(dim), zero bias.
pub fn init_parameters(dim: usize, classes: usize, seed: u64) -> ParameterSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let bound = 1.0 / (dim as f32).sqrt();
    let weight = (0..classes * dim).map(|_| rng.gen_range(-bound..bound)).collect();
    ParameterSet::new(vec![TensorData::new(vec![classes, dim], weight), TensorData::zeros(vec![classes])])
}

fn linear_vars(params: &ParameterSet, dev: &Device) -> Result<(Var, Var)> {
    let [weight, bias] = params.tensors.as_slice() else {
        return Err(FlError::TensorCount { expected: 2, actual: params.len() });
    };
    let &[out_dim, in_dim] = weight.shape.as_slice() else {
        return Err(FlError::ShapeMismatch { index: 0, expected: vec![0, 0], actual: weight.shape.clone() });
    };
    if bias.shape != [out_dim] {
        return Err(FlError::ShapeMismatch { index: 1, expected: vec![out_dim], actual: bias.shape.clone() });
    }
    params.validate()?;
    // Fresh storage: training below never touches the caller's values.
    let w = Var::from_tensor(&Tensor::from_vec(weight.values.clone(), (out_dim, in_dim), dev)?)?;
    let b = Var::from_tensor(&Tensor::from_vec(bias.values.clone(), out_dim, dev)?)?;
    Ok((w, b))
}

pub fn params_from_linear(weight: &Tensor, bias: &Tensor) -> Result<ParameterSet> {
    let (out_dim, in_dim) = weight.dims2()?;
    let w = weight.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let b = bias.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(ParameterSet::new(vec![TensorData::new(vec![out_dim, in_dim], w), TensorData::new(vec![out_dim], b)]))
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub parameters: ParameterSet,
    pub sample_count: u64,
    pub mean_loss: f32,
}

/// SGD over mini-batches of a private dataset.
pub struct LinearTrainer {
    dataset: LocalDataset,
    batch_size: usize,
    learning_rate: f64,
    device: Device,
}

impl LinearTrainer {
    pub fn new(dataset: LocalDataset, batch_size: usize, learning_rate: f64, device: Device) -> Self {
        Self { dataset, batch_size: batch_size.max(1), learning_rate, device }
    }

    pub fn dataset(&self) -> &LocalDataset {
        &self.dataset
    }

    /// Runs exactly one pass over the local data starting from `params`.
    pub fn train_epoch(&self, params: &ParameterSet) -> Result<TrainOutcome> {
        let (w, b) = linear_vars(params, &self.device)?;
        if w.dims() != [self.dataset.classes, self.dataset.dim] {
            return Err(FlError::ShapeMismatch {
                index: 0,
                expected: vec![self.dataset.classes, self.dataset.dim],
                actual: w.dims().to_vec(),
            });
        }
        let n = self.dataset.len();
        if n == 0 {
            return Ok(TrainOutcome { parameters: params.clone(), sample_count: 0, mean_loss: 0.0 });
        }

        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        let mut sgd = SGD::new(vec![w.clone(), b.clone()], self.learning_rate)?;
        let (xs, ys) = self.dataset.tensors(&self.device)?;

        let mut loss_sum = 0f32;
        let mut start = 0;
        while start < n {
            let len = self.batch_size.min(n - start);
            let logits = linear.forward(&xs.narrow(0, start, len)?)?;
            let log_sm = ops::log_softmax(&logits, D::Minus1)?;
            let batch_loss = loss::nll(&log_sm, &ys.narrow(0, start, len)?)?;
            sgd.backward_step(&batch_loss)?;
            loss_sum += batch_loss.to_scalar::<f32>()? * len as f32;
            start += len;
        }

        Ok(TrainOutcome {
            parameters: params_from_linear(w.as_tensor(), b.as_tensor())?,
            sample_count: n as u64,
            mean_loss: loss_sum / n as f32,
        })
    }
}

/// Scores parameters on the central validation set.
pub struct LinearValidator {
    dataset: LocalDataset,
    device: Device,
}

impl LinearValidator {
    pub fn new(dataset: LocalDataset, device: Device) -> Self {
        Self { dataset, device }
    }

    /// `map50` counts predictions that are correct with confidence >= 0.5;
    /// `map50_95` averages the same count over thresholds 0.50..=0.95.
    pub fn evaluate(&self, params: &ParameterSet) -> Result<Accuracy> {
        if self.dataset.is_empty() {
            return Err(FlError::Validation("validation set is empty".into()));
        }
        let probs = self.probabilities(params).map_err(|e| FlError::Validation(e.to_string()))?;

        let mut hits = [0usize; THRESHOLDS.len()];
        for (row, &label) in probs.iter().zip(&self.dataset.labels) {
            let Some((class, conf)) = row.iter().copied().enumerate().max_by(|a, b| a.1.total_cmp(&b.1)) else {
                continue;
            };
            if class as u32 != label {
                continue;
            }
            for (hit, t) in hits.iter_mut().zip(THRESHOLDS) {
                if conf >= t {
                    *hit += 1;
                }
            }
        }

        let n = self.dataset.len() as f64;
        let map50 = hits[0] as f64 / n;
        let map50_95 = hits.iter().map(|&h| h as f64 / n).sum::<f64>() / THRESHOLDS.len() as f64;
        Ok(Accuracy { map50, map50_95 })
    }

    fn probabilities(&self, params: &ParameterSet) -> Result<Vec<Vec<f32>>> {
        let (w, b) = linear_vars(params, &self.device)?;
        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        let (xs, _) = self.dataset.tensors(&self.device)?;
        let probs = ops::softmax(&linear.forward(&xs)?, D::Minus1)?;
        Ok(probs.to_vec2::<f32>()?)
    }
}
