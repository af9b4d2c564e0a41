//! Temporal convolutions in time-batch-channel weight layout.
//!
//! Weights are stored `[kernel, in_channels, out_channels]`, the layout of
//! the checkpoints. Activations stay batch-major (`[B, T, C]`) throughout the
//! crate; only the weight keeps the TBC convention.

mod linearized;

pub use linearized::LinearizedConvolution;

use anyhow::Result;
use ndarray::linalg::general_mat_mul;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayView3, ArrayViewMut2, Axis, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;
use rand::Rng;

use crate::activations::PARALLEL_THRESHOLD;
use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// Folds `W = g * v / ||v||` with one norm per output channel (dim 2).
pub fn weight_norm_out_channels(g: &Array1<f32>, v: &Array3<f32>) -> Result<Array3<f32>> {
    let out = v.dim().2;
    if g.len() != out {
        return Err(FConvError::shape("weight_g", format!("[{}]", out), g.shape()).into());
    }
    let mut w = v.clone();
    for ((mut plane, &gain), o) in w.axis_iter_mut(Axis(2)).zip(g.iter()).zip(0..out) {
        let norm = v.index_axis(Axis(2), o).iter().map(|x| x * x).sum::<f32>().sqrt();
        let scale = if norm > 0.0 { gain / norm } else { 0.0 };
        plane.mapv_inplace(|x| x * scale);
    }
    Ok(w)
}

/// 1D convolution over time with explicit zero padding.
#[derive(Debug, Clone)]
pub struct ConvTbc {
    /// `[kernel, in_channels, out_channels]`
    pub weight: Array3<f32>,
    pub bias: Array1<f32>,
}

impl ConvTbc {
    pub fn new(weight: Array3<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.dim().2 {
            return Err(FConvError::shape("conv bias", format!("[{}]", weight.dim().2), bias.shape()).into());
        }
        if weight.dim().0 == 0 {
            return Err(FConvError::shape("conv weight", "[kernel >= 1, .., ..]", weight.shape()).into());
        }
        Ok(Self { weight, bias })
    }

    /// Random init `N(0, sqrt(4 (1 - dropout) / (kernel * in_channels)))`.
    pub fn random<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let std = (4.0 * (1.0 - dropout) / (kernel_size * in_channels) as f32).sqrt();
        let normal = Normal::new(0.0, std)?;
        let weight = Array3::random_using((kernel_size, in_channels, out_channels), normal, rng);
        Self::new(weight, Array1::zeros(out_channels))
    }

    pub fn from_weights(weights: &ModelWeights, prefix: &str) -> Result<Self> {
        let g_name = format!("{}.weight_g", prefix);
        let weight = if weights.contains(&g_name) {
            let g = weights.get_flat(&g_name)?;
            let v = weights.get_array3(&format!("{}.weight_v", prefix))?;
            weight_norm_out_channels(&g, &v)?
        } else {
            weights.get_array3(&format!("{}.weight", prefix))?
        };
        let bias = weights.get_array1(&format!("{}.bias", prefix))?;
        Self::new(weight, bias)
    }

    pub fn export(&self, prefix: &str, state: &mut MemoryLoader) {
        state.insert(format!("{}.weight", prefix), self.weight.clone());
        state.insert(format!("{}.bias", prefix), self.bias.clone());
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dim().0
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().2
    }

    /// Convolves `[B, T, in]` after padding `pad_l` zeros before and `pad_r`
    /// zeros after the sequence. Output length is `T + pad_l + pad_r - k + 1`.
    pub fn forward(&self, input: &ArrayView3<f32>, pad_l: usize, pad_r: usize) -> Result<Array3<f32>> {
        let (batch, time, channels) = input.dim();
        if channels != self.in_channels() {
            return Err(FConvError::shape(
                "conv input",
                format!("[.., .., {}]", self.in_channels()),
                input.shape(),
            )
            .into());
        }
        let padded_len = time + pad_l + pad_r;
        let k = self.kernel_size();
        if padded_len < k {
            return Err(FConvError::shape(
                "conv input",
                format!("at least {} padded steps", k),
                input.shape(),
            )
            .into());
        }
        let out_len = padded_len - k + 1;

        let mut output = Array3::<f32>::zeros((batch, out_len, self.out_channels()));
        if output.len() >= PARALLEL_THRESHOLD {
            output
                .outer_iter_mut()
                .into_par_iter()
                .zip(input.outer_iter())
                .for_each(|(out_b, in_b)| self.convolve_one(in_b, out_b, pad_l, padded_len));
        } else {
            output
                .outer_iter_mut()
                .zip(input.outer_iter())
                .for_each(|(out_b, in_b)| self.convolve_one(in_b, out_b, pad_l, padded_len));
        }
        Ok(output)
    }

    fn convolve_one(&self, input: ArrayView2<f32>, mut output: ArrayViewMut2<f32>, pad_l: usize, padded_len: usize) {
        let (time, channels) = input.dim();
        let out_len = output.nrows();

        let mut padded = Array2::<f32>::zeros((padded_len, channels));
        padded.slice_mut(s![pad_l..pad_l + time, ..]).assign(&input);

        output += &self.bias;
        for (k, tap) in self.weight.outer_iter().enumerate() {
            let window = padded.slice(s![k..k + out_len, ..]);
            general_mat_mul(1.0, &window, &tap, 1.0, &mut output);
        }
    }
}

#[cfg(test)]
mod tests;
