//! Gating nonlinearities and softmax operations.

use anyhow::{Result, bail};
use libm::{expf, tanhf};
use ndarray::{Array3, ArrayView3, ArrayViewMut1, Axis, Zip, parallel::prelude::*, s};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

#[inline(always)]
pub fn sigmoid_scalar(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + expf(-x))
    } else {
        let e = expf(x);
        e / (1.0 + e)
    }
}

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

/// Gated linear unit over the channel axis.
///
/// Splits `[B, T, 2C]` into `a = x[.., .., ..C]` and `b = x[.., .., C..]`
/// and returns `a * sigmoid(b)` with shape `[B, T, C]`.
pub fn glu(x: &ArrayView3<f32>) -> Result<Array3<f32>> {
    let (batch, time, channels) = x.dim();
    if channels % 2 != 0 {
        bail!("glu expects an even channel count, got {}", channels);
    }
    let half = channels / 2;
    let value = x.slice(s![.., .., ..half]);
    let gate = x.slice(s![.., .., half..]);

    let mut out = Array3::<f32>::zeros((batch, time, half));
    let zip = Zip::from(&mut out).and(&value).and(&gate);
    if batch * time * half >= PARALLEL_THRESHOLD {
        zip.par_for_each(|o, &a, &g| *o = a * sigmoid_scalar(g));
    } else {
        zip.for_each(|o, &a, &g| *o = a * sigmoid_scalar(g));
    }
    Ok(out)
}

/// NGTU gate: tanh on the first `split` channels, then [`glu`].
///
/// With `split == C` for a `[B, T, 2C]` input this computes
/// `tanh(a) * sigmoid(b)`.
pub fn ngtu(x: &ArrayView3<f32>, split: usize) -> Result<Array3<f32>> {
    let channels = x.dim().2;
    if split > channels {
        bail!("ngtu split {} exceeds channel count {}", split, channels);
    }
    let mut gated = x.to_owned();
    {
        let mut head = gated.slice_mut(s![.., .., ..split]);
        if head.len() >= PARALLEL_THRESHOLD {
            head.par_mapv_inplace(tanh_scalar);
        } else {
            head.mapv_inplace(tanh_scalar);
        }
    }
    glu(&gated.view())
}

/// Applies softmax in-place to a slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

/// Applies log-softmax in-place to a slice.
pub fn log_softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = slice.iter().map(|&v| (v - max).exp()).sum();
    let log_norm = max + sum.ln();
    for v in slice.iter_mut() {
        *v -= log_norm;
    }
}

fn apply_row(mut row: ArrayViewMut1<f32>, f: fn(&mut [f32])) {
    if let Some(slice) = row.as_slice_mut() {
        f(slice);
    } else {
        let mut owned = row.to_vec();
        f(&mut owned);
        row.iter_mut().zip(owned).for_each(|(dst, v)| *dst = v);
    }
}

/// Applies softmax along the last axis of a 3D array.
pub fn softmax_last_axis(x: &mut Array3<f32>) {
    x.lanes_mut(Axis(2))
        .into_iter()
        .for_each(|row| apply_row(row, softmax_inplace));
}

/// Applies log-softmax along the last axis of a 3D array.
pub fn log_softmax_last_axis(x: &mut Array3<f32>) {
    x.lanes_mut(Axis(2))
        .into_iter()
        .for_each(|row| apply_row(row, log_softmax_inplace));
}
