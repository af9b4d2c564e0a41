use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView2, s};
use rand::Rng;

use crate::embeddings::Embedding;
use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// Replaces non-padding tokens with their position numbers.
///
/// Positions start at `padding_idx + 1`; padding tokens keep `padding_idx`.
/// With `left_pad`, numbering starts at the first real token of each row.
pub fn make_positions(tokens: &ArrayView2<u32>, padding_idx: u32, left_pad: bool) -> Array2<usize> {
    let (batch, time) = tokens.dim();
    let pad = padding_idx as usize;
    let mut positions = Array2::<usize>::from_elem((batch, time), pad);

    for b in 0..batch {
        let row = tokens.row(b);
        let offset = if left_pad {
            time - row.iter().filter(|&&id| id != padding_idx).count()
        } else {
            0
        };
        for (t, &id) in row.iter().enumerate() {
            if id != padding_idx {
                positions[[b, t]] = (pad + 1 + t).saturating_sub(offset);
            }
        }
    }
    positions
}

/// Learned absolute position embeddings.
#[derive(Debug, Clone)]
pub struct LearnedPositionalEmbedding {
    pub table: Embedding,
    pub padding_idx: u32,
    pub left_pad: bool,
}

impl LearnedPositionalEmbedding {
    /// Allocates `max_positions + padding_idx + 1` rows so that
    /// `max_positions` real positions fit after the padding slot.
    pub fn random<R: Rng + ?Sized>(
        max_positions: usize,
        dim: usize,
        padding_idx: u32,
        left_pad: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let rows = max_positions + padding_idx as usize + 1;
        Ok(Self {
            table: Embedding::random(rows, dim, rng)?,
            padding_idx,
            left_pad,
        })
    }

    pub fn from_weights(
        weights: &ModelWeights,
        name: &str,
        padding_idx: u32,
        left_pad: bool,
    ) -> Result<Self> {
        let table = Embedding::from_weights(weights, name)?;
        if table.num_embeddings() <= padding_idx as usize {
            return Err(FConvError::shape(
                name,
                format!("more than {} rows", padding_idx),
                table.weight.shape(),
            )
            .into());
        }
        Ok(Self {
            table,
            padding_idx,
            left_pad,
        })
    }

    pub fn export(&self, name: &str, state: &mut MemoryLoader) {
        self.table.export(name, state);
    }

    /// Maximum number of positions supported.
    pub fn max_positions(&self) -> usize {
        self.table.num_embeddings() - self.padding_idx as usize - 1
    }

    /// Embeds positions for `[B, T]` tokens.
    ///
    /// In incremental mode only the newest step is embedded: every row gets
    /// position `padding_idx + T` and the output is `[B, 1, dim]`.
    pub fn forward(&self, tokens: &ArrayView2<u32>, incremental: bool) -> Result<Array3<f32>> {
        let (batch, time) = tokens.dim();
        let positions = if incremental {
            Array2::from_elem((batch, 1), self.padding_idx as usize + time)
        } else {
            make_positions(tokens, self.padding_idx, self.left_pad)
        };

        let rows = self.table.num_embeddings();
        let (b_out, t_out) = positions.dim();
        let mut out = Array3::<f32>::zeros((b_out, t_out, self.table.dim()));
        for ((b, t), &pos) in positions.indexed_iter() {
            if pos >= rows {
                return Err(FConvError::PositionOutOfRange {
                    position: pos,
                    max: self.max_positions(),
                }
                .into());
            }
            out.slice_mut(s![b, t, ..]).assign(&self.table.weight.row(pos));
        }
        Ok(out)
    }
}
