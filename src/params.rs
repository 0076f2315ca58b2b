use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};

/// One learnable tensor, flattened row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, values: vec![0.0; n] }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Every learnable tensor of the model, in the key order shared by clients and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub tensors: Vec<TensorData>,
}

impl ParameterSet {
    pub fn new(tensors: Vec<TensorData>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape.clone()).collect()
    }

    /// Size of the raw f32 payload, reported as the "Model Size" metric.
    pub fn size_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.values.len() * std::mem::size_of::<f32>()).sum()
    }

    /// Checks that every tensor holds as many values as its shape declares.
    pub fn validate(&self) -> Result<()> {
        for (index, t) in self.tensors.iter().enumerate() {
            if t.numel() != t.values.len() {
                return Err(FlError::MalformedTensor { index, declared: t.numel(), actual: t.values.len() });
            }
        }
        Ok(())
    }
}

/// The expected tensor shapes of the model architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub shapes: Vec<Vec<usize>>,
}

impl ModelSpec {
    pub fn of(params: &ParameterSet) -> Self {
        Self { shapes: params.shapes() }
    }

    pub fn check(&self, params: &ParameterSet) -> Result<()> {
        if params.len() != self.shapes.len() {
            return Err(FlError::TensorCount { expected: self.shapes.len(), actual: params.len() });
        }
        for (index, (expected, t)) in self.shapes.iter().zip(&params.tensors).enumerate() {
            if *expected != t.shape {
                return Err(FlError::ShapeMismatch { index, expected: expected.clone(), actual: t.shape.clone() });
            }
        }
        params.validate()
    }
}

/// Writes the parameters as JSON, going through a sibling temp file so readers never see a partial checkpoint.
pub fn save_checkpoint(params: &ParameterSet, path: &Path) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec(params)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<ParameterSet> {
    let bytes = std::fs::read(path)?;
    let params: ParameterSet = serde_json::from_slice(&bytes)?;
    params.validate()?;
    Ok(params)
}
