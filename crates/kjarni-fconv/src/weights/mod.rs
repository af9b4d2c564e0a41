//! Weight loading infrastructure for model checkpoints.

mod memory;
mod model_weights;
mod safetensors_loader;

pub use memory::MemoryLoader;
pub use model_weights::ModelWeights;
pub use safetensors_loader::SafeTensorsLoader;

use anyhow::{Result, anyhow};
use half::{bf16, f16};
use ndarray::ArrayD;

/// On-disk element types accepted by the loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    /// Maps a safetensors::Dtype to our internal DType.
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            _ => Err(anyhow!("Unsupported safetensors DType: {:?}", dtype)),
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

/// Trait for reading named tensors from a checkpoint.
///
/// Every tensor is returned as f32; half precision formats are upcast.
pub trait WeightLoader: Send + Sync {
    /// Loads the tensor with the given name.
    fn get(&self, name: &str) -> Result<ArrayD<f32>>;

    /// Checks if a tensor with the given name exists.
    fn contains(&self, name: &str) -> bool;

    /// All tensor names, sorted.
    fn names(&self) -> Vec<String>;
}

/// Decodes little-endian tensor bytes into f32 values.
pub(crate) fn decode_f32(bytes: &[u8], dtype: DType) -> Result<Vec<f32>> {
    if bytes.len() % dtype.size_of() != 0 {
        return Err(anyhow!(
            "byte length {} is not a multiple of {:?} element size",
            bytes.len(),
            dtype
        ));
    }
    let values = match dtype {
        DType::F32 => match bytemuck::try_cast_slice::<u8, f32>(bytes) {
            Ok(slice) => slice.to_vec(),
            Err(_) => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        },
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };
    Ok(values)
}

#[cfg(test)]
mod tests;
