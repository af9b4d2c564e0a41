//! High-level interface for loading model weights.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, Array3, ArrayD, Ix1, Ix2, Ix3};

use crate::error::FConvError;
use crate::weights::{SafeTensorsLoader, WeightLoader};

/// Format-agnostic access to named checkpoint tensors.
///
/// `ModelWeights` is `Clone`; clones share the underlying loader.
#[derive(Clone)]
pub struct ModelWeights {
    loader: Arc<dyn WeightLoader>,
}

impl ModelWeights {
    /// Opens a `.safetensors` file, or a directory holding `model.safetensors`
    /// or a sharded `model.safetensors.index.json`.
    pub fn new(path: &Path) -> Result<Self> {
        let loader = SafeTensorsLoader::new(path)
            .with_context(|| format!("failed to open weights at {:?}", path))?;
        Ok(Self::from_loader(loader))
    }

    pub fn from_loader(loader: impl WeightLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.loader.contains(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.loader.names()
    }

    pub fn get_arrayd(&self, name: &str) -> Result<ArrayD<f32>> {
        if !self.loader.contains(name) {
            return Err(FConvError::MissingWeight(name.to_string()).into());
        }
        self.loader.get(name)
    }

    pub fn get_array1(&self, name: &str) -> Result<Array1<f32>> {
        let t = self.get_arrayd(name)?;
        let shape = t.shape().to_vec();
        t.into_dimensionality::<Ix1>()
            .map_err(|_| FConvError::shape(name, "1 dimension", &shape).into())
    }

    pub fn get_array2(&self, name: &str) -> Result<Array2<f32>> {
        let t = self.get_arrayd(name)?;
        let shape = t.shape().to_vec();
        t.into_dimensionality::<Ix2>()
            .map_err(|_| FConvError::shape(name, "2 dimensions", &shape).into())
    }

    pub fn get_array3(&self, name: &str) -> Result<Array3<f32>> {
        let t = self.get_arrayd(name)?;
        let shape = t.shape().to_vec();
        t.into_dimensionality::<Ix3>()
            .map_err(|_| FConvError::shape(name, "3 dimensions", &shape).into())
    }

    /// Loads a tensor and squeezes it to one dimension.
    ///
    /// Weight-norm gains are stored as `[out, 1]` or `[1, 1, out]`.
    pub fn get_flat(&self, name: &str) -> Result<Array1<f32>> {
        let t = self.get_arrayd(name)?;
        let len = t.len();
        let shape = t.shape().to_vec();
        t.into_shape_with_order(len)
            .map_err(|_| FConvError::shape(name, "a contiguous tensor", &shape).into())
    }
}
