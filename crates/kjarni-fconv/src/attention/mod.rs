//! Dot-product attention from decoder states to the encoder output.

use std::f32::consts::FRAC_1_SQRT_2;

use anyhow::Result;
use ndarray::linalg::general_mat_mul;
use ndarray::parallel::prelude::*;
use ndarray::{Array3, ArrayView2, ArrayView3, ArrayViewMut2};
use rand::Rng;

use crate::activations::{PARALLEL_THRESHOLD, softmax_last_axis};
use crate::error::FConvError;
use crate::linear_layer::LinearLayer;
use crate::weights::{MemoryLoader, ModelWeights};

/// Batched matrix product `[B, M, K] x [B, K, N] -> [B, M, N]`.
pub fn bmm(a: &ArrayView3<f32>, b: &ArrayView3<f32>) -> Array3<f32> {
    let (batch, m, _) = a.dim();
    let n = b.dim().2;
    let mut out = Array3::<f32>::zeros((batch, m, n));
    if out.len() >= PARALLEL_THRESHOLD {
        out.outer_iter_mut()
            .into_par_iter()
            .zip(a.outer_iter())
            .zip(b.outer_iter())
            .for_each(matmul_into);
    } else {
        out.outer_iter_mut()
            .zip(a.outer_iter())
            .zip(b.outer_iter())
            .for_each(matmul_into);
    }
    out
}

fn matmul_into(((mut out, a), b): ((ArrayViewMut2<f32>, ArrayView2<f32>), ArrayView2<f32>)) {
    general_mat_mul(1.0, &a, &b, 0.0, &mut out);
}

/// Attention layer attached to one decoder convolution.
///
/// `in_projection` maps conv channels to the topic-augmented embedding
/// width; `out_projection` maps the attended context back.
#[derive(Debug, Clone)]
pub struct AttentionLayer {
    pub in_projection: LinearLayer,
    pub out_projection: LinearLayer,
}

impl AttentionLayer {
    pub fn random<R: Rng + ?Sized>(conv_channels: usize, embed_dim: usize, rng: &mut R) -> Result<Self> {
        Ok(Self {
            in_projection: LinearLayer::random(conv_channels, embed_dim, 0.0, rng)?,
            out_projection: LinearLayer::random(embed_dim, conv_channels, 0.0, rng)?,
        })
    }

    pub fn from_weights(weights: &ModelWeights, prefix: &str) -> Result<Self> {
        let in_projection = LinearLayer::from_weights(weights, &format!("{}.in_projection", prefix))?;
        let out_projection = LinearLayer::from_weights(weights, &format!("{}.out_projection", prefix))?;
        if in_projection.out_features() != out_projection.in_features()
            || in_projection.in_features() != out_projection.out_features()
        {
            return Err(FConvError::shape(
                format!("{}.out_projection.weight", prefix),
                format!("[{}, {}]", in_projection.in_features(), in_projection.out_features()),
                out_projection.weight.shape(),
            )
            .into());
        }
        Ok(Self {
            in_projection,
            out_projection,
        })
    }

    pub fn export(&self, prefix: &str, state: &mut MemoryLoader) {
        self.in_projection.export(&format!("{}.in_projection", prefix), state);
        self.out_projection.export(&format!("{}.out_projection", prefix), state);
    }

    /// Attends from `x [B, T, C]` over the encoder output.
    ///
    /// `encoder_a_t` is the transposed encoder output `[B, D, S]` used for
    /// scoring; `encoder_b` is `[B, S, D]` and supplies the values. Returns the
    /// new states `[B, T, C]` and the attention weights `[B, T, S]`.
    pub fn forward(
        &self,
        x: &ArrayView3<f32>,
        target_embedding: &ArrayView3<f32>,
        encoder_a_t: &ArrayView3<f32>,
        encoder_b: &ArrayView3<f32>,
    ) -> Result<(Array3<f32>, Array3<f32>)> {
        let (batch, time, _) = x.dim();
        let dim = self.in_projection.out_features();
        let (_, _, src_len) = encoder_a_t.dim();

        if target_embedding.dim() != (batch, time, dim) {
            return Err(FConvError::shape(
                "target embedding",
                format!("[{}, {}, {}]", batch, time, dim),
                target_embedding.shape(),
            )
            .into());
        }
        if src_len == 0 || encoder_a_t.dim() != (batch, dim, src_len) {
            return Err(FConvError::shape(
                "encoder_a",
                format!("[{}, {}, S >= 1]", batch, dim),
                encoder_a_t.shape(),
            )
            .into());
        }
        if encoder_b.dim() != (batch, src_len, dim) {
            return Err(FConvError::shape(
                "encoder_b",
                format!("[{}, {}, {}]", batch, src_len, dim),
                encoder_b.shape(),
            )
            .into());
        }

        let mut query = self.in_projection.forward(x)?;
        query += target_embedding;
        query *= FRAC_1_SQRT_2;

        let mut attn = bmm(&query.view(), encoder_a_t);
        softmax_last_axis(&mut attn);

        let s = src_len as f32;
        let mut context = bmm(&attn.view(), encoder_b);
        context *= s * (1.0 / s).sqrt();

        let mut out = self.out_projection.forward(&context.view())?;
        out += x;
        out *= FRAC_1_SQRT_2;
        Ok((out, attn))
    }
}

#[cfg(test)]
mod tests;
