use anyhow::Result;
use ndarray::{Array3, ArrayView3, Axis, s};
use rand::Rng;

use crate::conv::ConvTbc;
use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// Causal convolution for the decoder.
///
/// A full pass left-pads by `kernel - 1`, so step `t` only sees inputs
/// `..=t`. An incremental pass keeps the last `kernel` inputs in a
/// `[B, kernel, C]` buffer and emits one output step per call; both paths
/// produce the same values.
#[derive(Debug, Clone)]
pub struct LinearizedConvolution {
    pub conv: ConvTbc,
}

impl LinearizedConvolution {
    pub fn new(conv: ConvTbc) -> Self {
        Self { conv }
    }

    pub fn random<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self::new(ConvTbc::random(in_channels, out_channels, kernel_size, dropout, rng)?))
    }

    pub fn from_weights(weights: &ModelWeights, prefix: &str) -> Result<Self> {
        Ok(Self::new(ConvTbc::from_weights(weights, prefix)?))
    }

    pub fn export(&self, prefix: &str, state: &mut MemoryLoader) {
        self.conv.export(prefix, state);
    }

    pub fn kernel_size(&self) -> usize {
        self.conv.kernel_size()
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    /// Full-sequence causal pass, `[B, T, in] -> [B, T, out]`.
    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        self.conv.forward(input, self.kernel_size() - 1, 0)
    }

    /// Single-step pass. Only the last time step of `input` is consumed.
    ///
    /// `buffer` is created on first use and must keep the same batch size
    /// between calls (reorder it to change the batch).
    pub fn forward_step(&self, input: &ArrayView3<f32>, buffer: &mut Option<Array3<f32>>) -> Result<Array3<f32>> {
        let (batch, time, channels) = input.dim();
        if time == 0 || channels != self.conv.in_channels() {
            return Err(FConvError::shape(
                "incremental conv input",
                format!("[.., >= 1, {}]", self.conv.in_channels()),
                input.shape(),
            )
            .into());
        }
        let k = self.kernel_size();
        let buf = buffer.get_or_insert_with(|| Array3::zeros((batch, k, channels)));
        if buf.dim() != (batch, k, channels) {
            return Err(FConvError::shape(
                "incremental conv buffer",
                format!("[{}, {}, {}]", batch, k, channels),
                buf.shape(),
            )
            .into());
        }

        if k > 1 {
            let tail = buf.slice(s![.., 1.., ..]).to_owned();
            buf.slice_mut(s![.., ..k - 1, ..]).assign(&tail);
        }
        buf.slice_mut(s![.., k - 1, ..])
            .assign(&input.index_axis(Axis(1), time - 1));

        self.conv.forward(&buf.view(), 0, 0)
    }
}
