//! SafeTensors format loader backed by memory maps.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use memmap2::Mmap;
use ndarray::{ArrayD, IxDyn};
use safetensors::SafeTensors;

use crate::weights::{DType, WeightLoader, decode_f32};

/// A loader for `.safetensors` files.
#[derive(Debug)]
pub struct SafeTensorsLoader {
    shards: Vec<Shard>,
    tensor_to_shard: HashMap<String, usize>,
}

#[derive(Debug)]
struct Shard {
    mmap: Mmap,
    data_start: usize,
    entries: HashMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    dtype: DType,
    shape: Vec<usize>,
    offsets: (usize, usize),
}

impl SafeTensorsLoader {
    /// Creates a new SafeTensors loader.
    ///
    /// Accepts either a direct file path or a directory containing
    /// `model.safetensors` or `model.safetensors.index.json` + shards.
    pub fn new(path: &Path) -> Result<Self> {
        if path.is_file() {
            return Self::load_single(path);
        }

        if !path.is_dir() {
            return Err(anyhow!("path {:?} is neither a file nor a directory", path));
        }

        let index_file = path.join("model.safetensors.index.json");
        if index_file.exists() {
            Self::load_sharded(path)
        } else {
            Self::load_single(&path.join("model.safetensors"))
        }
    }

    fn load_single(path: &Path) -> Result<Self> {
        let shard = Self::load_shard(path)?;
        let tensor_to_shard = shard.entries.keys().map(|name| (name.clone(), 0)).collect();

        log::info!(
            "loaded single safetensors file: {} tensors from {:?}",
            shard.entries.len(),
            path.file_name().unwrap_or_default()
        );

        Ok(Self {
            shards: vec![shard],
            tensor_to_shard,
        })
    }

    fn load_sharded(path: &Path) -> Result<Self> {
        let index_path = path.join("model.safetensors.index.json");
        let index_content = fs::read_to_string(&index_path)
            .with_context(|| format!("failed to read index file: {:?}", index_path))?;

        let index: serde_json::Value =
            serde_json::from_str(&index_content).context("failed to parse index.json")?;

        let weight_map = index["weight_map"]
            .as_object()
            .ok_or_else(|| anyhow!("invalid index.json: missing 'weight_map' object"))?;

        let mut unique_files: Vec<String> = weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        unique_files.sort();
        unique_files.dedup();

        log::info!(
            "loading sharded checkpoint: {} shards, {} tensors",
            unique_files.len(),
            weight_map.len()
        );

        let mut shards = Vec::with_capacity(unique_files.len());
        let mut file_to_shard_idx = HashMap::new();
        for (idx, filename) in unique_files.iter().enumerate() {
            shards.push(Self::load_shard(&path.join(filename))?);
            file_to_shard_idx.insert(filename.clone(), idx);
            log::debug!("loaded shard {}/{}: {}", idx + 1, unique_files.len(), filename);
        }

        let tensor_to_shard = weight_map
            .iter()
            .filter_map(|(name, file_val)| {
                let shard_idx = file_to_shard_idx.get(file_val.as_str()?)?;
                Some((name.clone(), *shard_idx))
            })
            .collect();

        Ok(Self {
            shards,
            tensor_to_shard,
        })
    }

    fn load_shard(path: &Path) -> Result<Shard> {
        let file = fs::File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        // SAFETY: the file is opened read-only and the map is never written through.
        let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("failed to mmap {:?}", path))?;

        let (header_len, metadata) = SafeTensors::read_metadata(&mmap)
            .map_err(|e| anyhow!("failed to parse safetensors {:?}: {:?}", path, e))?;

        let mut entries = HashMap::new();
        for (name, info) in metadata.tensors() {
            entries.insert(
                name,
                Entry {
                    dtype: DType::from_safetensors(info.dtype)?,
                    shape: info.shape.clone(),
                    offsets: info.data_offsets,
                },
            );
        }

        Ok(Shard {
            mmap,
            data_start: 8 + header_len,
            entries,
        })
    }

    /// Returns the number of tensors.
    pub fn tensor_count(&self) -> usize {
        self.tensor_to_shard.len()
    }

    /// Returns the number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl WeightLoader for SafeTensorsLoader {
    fn get(&self, name: &str) -> Result<ArrayD<f32>> {
        let shard_idx = self
            .tensor_to_shard
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' not found in model", name))?;
        let shard = &self.shards[*shard_idx];
        let entry = shard
            .entries
            .get(name)
            .ok_or_else(|| anyhow!("tensor '{}' listed in index but missing from shard", name))?;

        let (begin, end) = entry.offsets;
        let bytes = shard
            .mmap
            .get(shard.data_start + begin..shard.data_start + end)
            .ok_or_else(|| anyhow!("tensor '{}' data lies outside the file", name))?;
        let values = decode_f32(bytes, entry.dtype)
            .with_context(|| format!("failed to decode tensor '{}'", name))?;

        Ok(ArrayD::from_shape_vec(IxDyn(&entry.shape), values)?)
    }

    fn contains(&self, name: &str) -> bool {
        self.tensor_to_shard.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensor_to_shard.keys().cloned().collect();
        names.sort();
        names
    }
}
