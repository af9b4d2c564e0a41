//! Token and learned positional embeddings.

mod positional;

pub use positional::{LearnedPositionalEmbedding, make_positions};

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;
use rand::Rng;

use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// Standard deviation used to initialise embedding tables.
pub const EMBEDDING_INIT_STD: f32 = 0.1;

/// A lookup table `[num_embeddings, embedding_dim]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub weight: Array2<f32>,
}

impl Embedding {
    pub fn new(weight: Array2<f32>) -> Self {
        Self { weight }
    }

    /// Random init `N(0, 0.1)` over the whole table.
    pub fn random<R: Rng + ?Sized>(num_embeddings: usize, dim: usize, rng: &mut R) -> Result<Self> {
        let normal = Normal::new(0.0, EMBEDDING_INIT_STD)?;
        Ok(Self::new(Array2::random_using((num_embeddings, dim), normal, rng)))
    }

    /// Builds a table from a pretrained matrix, keeping its first `dim`
    /// columns. NaN becomes 0 and infinities are clamped to the finite range.
    pub fn from_pretrained(matrix: &ArrayView2<f32>, dim: usize) -> Result<Self> {
        if matrix.ncols() < dim {
            return Err(FConvError::shape(
                "pretrained embeddings",
                format!("[.., >= {}]", dim),
                matrix.shape(),
            )
            .into());
        }
        let weight = matrix.slice(s![.., ..dim]).mapv(nan_to_num);
        Ok(Self::new(weight))
    }

    pub fn from_weights(weights: &ModelWeights, name: &str) -> Result<Self> {
        Ok(Self::new(weights.get_array2(name)?))
    }

    pub fn export(&self, name: &str, state: &mut MemoryLoader) {
        state.insert(name.to_string(), self.weight.clone());
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Looks up `[B, T]` token ids, returning `[B, T, dim]`.
    pub fn forward(&self, tokens: &ArrayView2<u32>) -> Result<Array3<f32>> {
        let (batch, time) = tokens.dim();
        let mut out = Array3::<f32>::zeros((batch, time, self.dim()));
        for ((b, t), &id) in tokens.indexed_iter() {
            let row = id as usize;
            if row >= self.num_embeddings() {
                return Err(FConvError::TokenOutOfRange {
                    id,
                    size: self.num_embeddings(),
                }
                .into());
            }
            out.slice_mut(s![b, t, ..]).assign(&self.weight.row(row));
        }
        Ok(out)
    }
}

fn nan_to_num(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else if v == f32::INFINITY {
        f32::MAX
    } else if v == f32::NEG_INFINITY {
        f32::MIN
    } else {
        v
    }
}
