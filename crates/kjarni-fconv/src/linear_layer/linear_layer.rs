use anyhow::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;
use rand::Rng;

use crate::error::FConvError;
use crate::linear_layer::weight_norm_rows;
use crate::weights::{MemoryLoader, ModelWeights};

/// A CPU-based linear transformation layer (y = xW^T + b).
#[derive(Debug, Clone)]
pub struct LinearLayer {
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    /// Random init `N(0, sqrt((1 - dropout) / in_features))` with zero bias.
    pub fn random<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let std = ((1.0 - dropout) / in_features as f32).sqrt();
        let normal = Normal::new(0.0, std)?;
        let weight = Array2::random_using((out_features, in_features), normal, rng);
        Ok(Self::new(weight, Array1::zeros(out_features)))
    }

    /// Loads `{prefix}.weight_g` / `{prefix}.weight_v` (weight-normalized) or
    /// a plain `{prefix}.weight`, plus `{prefix}.bias` when present.
    pub fn from_weights(weights: &ModelWeights, prefix: &str) -> Result<Self> {
        let g_name = format!("{}.weight_g", prefix);
        let weight = if weights.contains(&g_name) {
            let g = weights.get_flat(&g_name)?;
            let v = weights.get_array2(&format!("{}.weight_v", prefix))?;
            weight_norm_rows(&g, &v)?
        } else {
            weights.get_array2(&format!("{}.weight", prefix))?
        };

        let bias_name = format!("{}.bias", prefix);
        let bias = if weights.contains(&bias_name) {
            let b = weights.get_array1(&bias_name)?;
            if b.len() != weight.nrows() {
                return Err(FConvError::shape(bias_name, format!("[{}]", weight.nrows()), b.shape()).into());
            }
            Some(b)
        } else {
            None
        };

        Ok(Self { weight, bias })
    }

    /// Writes the effective (folded) weight and bias.
    pub fn export(&self, prefix: &str, state: &mut MemoryLoader) {
        state.insert(format!("{}.weight", prefix), self.weight.clone());
        if let Some(b) = &self.bias {
            state.insert(format!("{}.bias", prefix), b.clone());
        }
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Computes `y = x @ W^T + b` for a `[rows, in]` input.
    #[inline]
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = input.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            result.outer_iter_mut().for_each(|mut row| row += b);
        }
        result
    }

    /// Applies the layer to the last axis of a `[B, T, in]` tensor.
    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (batch, time, features) = input.dim();
        if features != self.in_features() {
            return Err(FConvError::shape(
                "linear input",
                format!("[.., .., {}]", self.in_features()),
                input.shape(),
            )
            .into());
        }
        let flat = input
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch * time, features))?;
        let out = self.matmul(&flat.view());
        Ok(out.into_shape_with_order((batch, time, self.out_features()))?)
    }

    pub fn forward_3d(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        self.forward(&input.view())
    }
}
