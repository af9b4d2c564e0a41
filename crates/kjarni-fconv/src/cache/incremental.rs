use std::any::Any;

use anyhow::{Result, bail};
use ndarray::{Array3, Axis};
use rayon::prelude::*;

use crate::cache::Cache;

/// Per-sequence decoder state for step-by-step generation.
///
/// Holds one input window per decoder convolution and the encoder output
/// already split and transposed for attention. Batch rows of every tensor
/// line up, so [`IncrementalState::reorder`] can follow beam selections.
#[derive(Debug, Clone, Default)]
pub struct IncrementalState {
    conv_buffers: Vec<Option<Array3<f32>>>,
    /// `(encoder_a^T [B, D, S], encoder_b [B, S, D])`
    encoder_out: Option<(Array3<f32>, Array3<f32>)>,
    steps: usize,
}

impl IncrementalState {
    pub fn new(num_layers: usize) -> Self {
        Self {
            conv_buffers: vec![None; num_layers],
            encoder_out: None,
            steps: 0,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.conv_buffers.len()
    }

    pub fn conv_buffer(&self, layer: usize) -> Option<&Array3<f32>> {
        self.conv_buffers.get(layer).and_then(Option::as_ref)
    }

    pub fn conv_buffer_mut(&mut self, layer: usize) -> Result<&mut Option<Array3<f32>>> {
        let num_layers = self.conv_buffers.len();
        match self.conv_buffers.get_mut(layer) {
            Some(buffer) => Ok(buffer),
            None => bail!("layer index {} out of bounds (num_layers={})", layer, num_layers),
        }
    }

    pub fn encoder_out(&self) -> Option<(&Array3<f32>, &Array3<f32>)> {
        self.encoder_out.as_ref().map(|(a, b)| (a, b))
    }

    pub fn set_encoder_out(&mut self, encoder_a_t: Array3<f32>, encoder_b: Array3<f32>) {
        self.encoder_out = Some((encoder_a_t, encoder_b));
    }

    /// Borrows the cached encoder output alongside the mutable conv buffers.
    pub(crate) fn encoder_and_buffers(
        &mut self,
    ) -> (Option<&(Array3<f32>, Array3<f32>)>, &mut [Option<Array3<f32>>]) {
        (self.encoder_out.as_ref(), &mut self.conv_buffers)
    }

    /// Batch size of the cached tensors, if any have been written.
    pub fn batch_size(&self) -> Option<usize> {
        self.conv_buffers
            .iter()
            .flatten()
            .map(|b| b.dim().0)
            .next()
            .or_else(|| self.encoder_out.as_ref().map(|(a, _)| a.dim().0))
    }

    /// Selects batch rows `new_order` from every cached tensor.
    ///
    /// `new_order` may be longer than the current batch (beam expansion) and
    /// may repeat indices.
    pub fn reorder(&mut self, new_order: &[usize]) -> Result<()> {
        let Some(batch) = self.batch_size() else {
            return Ok(());
        };
        if let Some(&bad) = new_order.iter().find(|&&i| i >= batch) {
            bail!("reorder index {} out of bounds for batch of {}", bad, batch);
        }

        self.conv_buffers.par_iter_mut().flatten().for_each(|buffer| {
            *buffer = buffer.select(Axis(0), new_order);
        });
        if let Some((a, b)) = self.encoder_out.as_mut() {
            *a = a.select(Axis(0), new_order);
            *b = b.select(Axis(0), new_order);
        }
        log::trace!("reordered incremental state to {} rows", new_order.len());
        Ok(())
    }
}

impl Cache for IncrementalState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn get_seq_length(&self) -> usize {
        self.steps
    }

    fn set_seq_length(&mut self, len: usize) {
        self.steps = len;
    }

    fn clear(&mut self) {
        self.conv_buffers.iter_mut().for_each(|b| *b = None);
        self.encoder_out = None;
        self.steps = 0;
    }

    fn increment_len(&mut self, new_tokens_len: usize) {
        self.steps += new_tokens_len;
    }

    fn clone_box(&self) -> Box<dyn Cache> {
        Box::new(self.clone())
    }
}
