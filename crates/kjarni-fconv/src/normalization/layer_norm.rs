//! Layer normalization implementation

use anyhow::Result;
use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// Layer normalization over the channel (last) axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Unit scale, zero shift.
    pub fn identity(dim: usize, eps: f32) -> Self {
        Self::new(Array1::ones(dim), Array1::zeros(dim), eps)
    }

    pub fn from_weights(weights: &ModelWeights, prefix: &str, eps: f32) -> Result<Self> {
        let weight = weights.get_array1(&format!("{}.weight", prefix))?;
        let bias = weights.get_array1(&format!("{}.bias", prefix))?;
        if weight.len() != bias.len() {
            return Err(FConvError::shape(
                format!("{}.bias", prefix),
                format!("[{}]", weight.len()),
                bias.shape(),
            )
            .into());
        }
        Ok(Self { weight, bias, eps })
    }

    pub fn export(&self, prefix: &str, state: &mut MemoryLoader) {
        state.insert(format!("{}.weight", prefix), self.weight.clone());
        state.insert(format!("{}.bias", prefix), self.bias.clone());
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    /// Apply layer norm to a 3D tensor of activations.
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let channels = hidden_states.dim().2;
        if channels != self.dim() {
            return Err(FConvError::shape(
                "layer norm input",
                format!("[.., .., {}]", self.dim()),
                hidden_states.shape(),
            )
            .into());
        }
        if hidden_states.is_empty() {
            return Ok(hidden_states.to_owned());
        }

        let mean = hidden_states.sum_axis(Axis(2)) / channels as f32;
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let inv_std = variance.mapv(|v| 1.0 / (v + self.eps).sqrt()).insert_axis(Axis(2));

        let normalized = (hidden_states - &mean_expanded) * &inv_std;
        Ok(normalized * &self.weight + &self.bias)
    }

    /// Apply layer norm to a 3D tensor
    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        self.forward(&hidden.view())
    }
}
