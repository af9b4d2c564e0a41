//! In-memory checkpoint, used for state dicts built in code.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use ndarray::{ArrayD, Dimension};

use crate::weights::WeightLoader;

/// A named collection of f32 tensors held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor of any dimensionality, replacing an existing entry.
    pub fn insert<D: Dimension>(&mut self, name: impl Into<String>, tensor: ndarray::Array<f32, D>) {
        self.tensors.insert(name.into(), tensor.into_dyn());
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Writes all tensors to a single `.safetensors` file as F32.
    pub fn save_safetensors(&self, path: &std::path::Path) -> Result<()> {
        let stored: Vec<(String, Vec<usize>, Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let bytes = t.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.clone(), t.shape().to_vec(), bytes)
            })
            .collect();

        let mut views = Vec::with_capacity(stored.len());
        for (name, shape, bytes) in &stored {
            let view = safetensors::tensor::TensorView::new(
                safetensors::Dtype::F32,
                shape.clone(),
                bytes,
            )?;
            views.push((name.clone(), view));
        }
        safetensors::serialize_to_file(views, &None, path)?;
        log::info!("wrote {} tensors to {:?}", stored.len(), path);
        Ok(())
    }
}

impl WeightLoader for MemoryLoader {
    fn get(&self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("tensor '{}' not found in model", name))
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }
}
