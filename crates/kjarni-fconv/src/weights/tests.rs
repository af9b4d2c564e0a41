use std::collections::HashMap;
use std::path::Path;

use half::{bf16, f16};
use ndarray::{Array1, Array2, Array3, arr1, arr2};
use safetensors::tensor::{Dtype, TensorView as StTensorView};
use tempfile::TempDir;

use super::*;
use crate::error::FConvError;

fn write_file(path: &Path, tensors: &[(&str, Dtype, Vec<u8>, Vec<usize>)]) {
    let mut views = HashMap::new();
    for (name, dtype, bytes, shape) in tensors {
        views.insert(
            name.to_string(),
            StTensorView::new(*dtype, shape.clone(), bytes).unwrap(),
        );
    }
    safetensors::serialize_to_file(&views, &None, path).unwrap();
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_decode_f32_unaligned_and_half() {
    let bytes = f32_bytes(&[1.5, -2.0]);
    assert_eq!(decode_f32(&bytes, DType::F32).unwrap(), vec![1.5, -2.0]);

    let half_bytes: Vec<u8> = [0.5f32, 3.0]
        .iter()
        .flat_map(|v| f16::from_f32(*v).to_le_bytes())
        .collect();
    assert_eq!(decode_f32(&half_bytes, DType::F16).unwrap(), vec![0.5, 3.0]);

    let bf_bytes: Vec<u8> = [1.0f32, -4.0]
        .iter()
        .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
        .collect();
    assert_eq!(decode_f32(&bf_bytes, DType::BF16).unwrap(), vec![1.0, -4.0]);

    assert!(decode_f32(&[0u8, 1, 2], DType::F32).is_err());
}

#[test]
fn test_load_nonexistent_path() {
    assert!(SafeTensorsLoader::new(Path::new("does-not-exist.safetensors")).is_err());
}

#[test]
fn test_load_invalid_file() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("model.safetensors"), b"not a safetensors file").unwrap();
    let err = SafeTensorsLoader::new(dir.path()).unwrap_err();
    assert!(err.to_string().contains("failed to parse"));
}

#[test]
fn test_single_file_mixed_dtypes() {
    let dir = TempDir::new().unwrap();
    let half: Vec<u8> = [1.0f32, 2.0, 3.0]
        .iter()
        .flat_map(|v| f16::from_f32(*v).to_le_bytes())
        .collect();
    write_file(
        &dir.path().join("model.safetensors"),
        &[
            ("fc1.weight", Dtype::F32, f32_bytes(&[1.0, 2.0, 3.0, 4.0]), vec![2, 2]),
            ("fc1.bias", Dtype::F16, half, vec![3]),
        ],
    );

    let loader = SafeTensorsLoader::new(dir.path()).unwrap();
    assert_eq!(loader.tensor_count(), 2);
    assert_eq!(loader.shard_count(), 1);
    assert_eq!(loader.names(), vec!["fc1.bias".to_string(), "fc1.weight".to_string()]);

    let weights = ModelWeights::from_loader(loader);
    assert_eq!(weights.get_array2("fc1.weight").unwrap(), arr2(&[[1.0, 2.0], [3.0, 4.0]]));
    assert_eq!(weights.get_array1("fc1.bias").unwrap(), arr1(&[1.0, 2.0, 3.0]));
}

#[test]
fn test_sharded_directory() {
    let dir = TempDir::new().unwrap();
    write_file(
        &dir.path().join("shard-1.safetensors"),
        &[("a", Dtype::F32, f32_bytes(&[1.0]), vec![1])],
    );
    write_file(
        &dir.path().join("shard-2.safetensors"),
        &[("b", Dtype::F32, f32_bytes(&[2.0, 3.0]), vec![2])],
    );
    let index = serde_json::json!({
        "weight_map": { "a": "shard-1.safetensors", "b": "shard-2.safetensors" }
    });
    std::fs::write(
        dir.path().join("model.safetensors.index.json"),
        serde_json::to_string(&index).unwrap(),
    )
    .unwrap();

    let loader = SafeTensorsLoader::new(dir.path()).unwrap();
    assert_eq!(loader.shard_count(), 2);
    assert_eq!(loader.get("b").unwrap().iter().copied().collect::<Vec<f32>>(), vec![2.0, 3.0]);
}

#[test]
fn test_missing_weight_is_typed() {
    let weights = ModelWeights::from_loader(MemoryLoader::new());
    let err = weights.get_array1("decoder.fc3.bias").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FConvError>(),
        Some(FConvError::MissingWeight(name)) if name == "decoder.fc3.bias"
    ));
}

#[test]
fn test_wrong_rank_is_typed() {
    let mut mem = MemoryLoader::new();
    mem.insert("w", Array2::<f32>::zeros((2, 2)));
    let weights = ModelWeights::from_loader(mem);
    let err = weights.get_array3("w").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FConvError>(),
        Some(FConvError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_get_flat_squeezes_gain() {
    let mut mem = MemoryLoader::new();
    mem.insert("g", Array3::from_shape_vec((1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap());
    let weights = ModelWeights::from_loader(mem);
    assert_eq!(weights.get_flat("g").unwrap(), Array1::from(vec![1.0, 2.0, 3.0]));
}

#[test]
fn test_memory_loader_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.safetensors");

    let mut mem = MemoryLoader::new();
    mem.insert("encoder.lay_norm.weight", arr1(&[1.0, 1.0]));
    mem.insert("encoder.fc1.weight", arr2(&[[0.5, -0.5], [0.25, 2.0]]));
    mem.save_safetensors(&path).unwrap();

    let reloaded = ModelWeights::new(&path).unwrap();
    assert_eq!(reloaded.names().len(), 2);
    assert_eq!(
        reloaded.get_array2("encoder.fc1.weight").unwrap(),
        arr2(&[[0.5, -0.5], [0.25, 2.0]])
    );
}
