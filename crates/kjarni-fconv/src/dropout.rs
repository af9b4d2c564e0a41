//! Inverted dropout.

use ndarray::{Array, Dimension};
use rand::Rng;

/// Inverted dropout: survivors are rescaled by `1 / (1 - p)` so that
/// evaluation needs no correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    pub p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn forward<D: Dimension>(&self, x: Array<f32, D>, training: bool) -> Array<f32, D> {
        self.forward_with_rng(x, training, &mut rand::thread_rng())
    }

    pub fn forward_with_rng<D: Dimension, R: Rng + ?Sized>(
        &self,
        mut x: Array<f32, D>,
        training: bool,
        rng: &mut R,
    ) -> Array<f32, D> {
        if !training || self.p <= 0.0 {
            return x;
        }
        if self.p >= 1.0 {
            x.fill(0.0);
            return x;
        }
        let keep = 1.0 - self.p;
        let scale = 1.0 / keep;
        x.mapv_inplace(|v| if rng.gen::<f32>() < keep { v * scale } else { 0.0 });
        x
    }
}
