//! A CPU linear layer with optional weight normalization.
//!
//! Weights are stored in the `[OutFeatures, InFeatures]` layout used by the
//! checkpoints. Weight-normalized checkpoints carry a gain `weight_g` and a
//! direction `weight_v`; the effective weight is folded once at load time,
//! so the forward pass never sees the decomposition.

mod linear_layer;

pub use linear_layer::LinearLayer;

use anyhow::Result;
use ndarray::{Array1, Array2, Axis};

use crate::error::FConvError;

/// Folds `W = g * v / ||v||`, with the norm taken over each output row.
pub fn weight_norm_rows(g: &Array1<f32>, v: &Array2<f32>) -> Result<Array2<f32>> {
    if g.len() != v.nrows() {
        return Err(FConvError::shape("weight_g", format!("[{}]", v.nrows()), g.shape()).into());
    }
    let norms = v.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    let mut w = v.clone();
    for ((mut row, &gain), &norm) in w.outer_iter_mut().zip(g.iter()).zip(norms.iter()) {
        let scale = if norm > 0.0 { gain / norm } else { 0.0 };
        row.mapv_inplace(|x| x * scale);
    }
    Ok(w)
}
