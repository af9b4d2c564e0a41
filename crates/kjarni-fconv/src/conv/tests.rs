use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array3, arr1, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::*;
use crate::weights::{MemoryLoader, ModelWeights};

/// Kernel 2, one input and one output channel: y[t] = 1*x[t] + 10*x[t+1] + 0.5
fn tiny_conv() -> ConvTbc {
    let weight = Array3::from_shape_vec((2, 1, 1), vec![1.0, 10.0]).unwrap();
    ConvTbc::new(weight, arr1(&[0.5])).unwrap()
}

#[test]
fn test_conv_tbc_golden() {
    let conv = tiny_conv();
    let x = Array3::from_shape_vec((1, 3, 1), vec![1.0, 2.0, 3.0]).unwrap();

    let out = conv.forward(&x.view(), 0, 0).unwrap();
    assert_eq!(out.shape(), &[1, 2, 1]);
    assert_abs_diff_eq!(out[[0, 0, 0]], 21.5);
    assert_abs_diff_eq!(out[[0, 1, 0]], 32.5);

    // Padding ((k-1)/2, k/2) = (0, 1) keeps the length.
    let out = conv.forward(&x.view(), 0, 1).unwrap();
    assert_eq!(out.shape(), &[1, 3, 1]);
    assert_abs_diff_eq!(out[[0, 2, 0]], 3.5);
}

#[test]
fn test_conv_tbc_mixes_channels() {
    // Kernel 1 reduces to a per-step matrix multiply.
    let weight = Array3::from_shape_vec((1, 2, 3), vec![1.0, 0.0, 2.0, 0.0, 1.0, -1.0]).unwrap();
    let conv = ConvTbc::new(weight, Array1::zeros(3)).unwrap();
    let x = Array3::from_shape_vec((2, 1, 2), vec![3.0, 4.0, -1.0, 1.0]).unwrap();
    let out = conv.forward(&x.view(), 0, 0).unwrap();
    assert_eq!(out.slice(s![0, 0, ..]).to_vec(), vec![3.0, 4.0, 2.0]);
    assert_eq!(out.slice(s![1, 0, ..]).to_vec(), vec![-1.0, 1.0, -3.0]);
}

#[test]
fn test_conv_tbc_rejects_bad_input() {
    let conv = tiny_conv();
    assert!(conv.forward(&Array3::zeros((1, 3, 2)).view(), 0, 0).is_err());
    assert!(conv.forward(&Array3::zeros((1, 1, 1)).view(), 0, 0).is_err());
    assert!(ConvTbc::new(Array3::zeros((3, 2, 4)), Array1::zeros(3)).is_err());
}

#[test]
fn test_conv_tbc_parallel_matches_per_row() {
    let mut rng = StdRng::seed_from_u64(11);
    let conv = ConvTbc::random(16, 32, 3, 0.1, &mut rng).unwrap();
    let x = Array3::random_using((8, 80, 16), Uniform::new(-1.0f32, 1.0), &mut rng);

    let full = conv.forward(&x.view(), 1, 1).unwrap();
    assert!(full.len() >= crate::activations::PARALLEL_THRESHOLD);

    let row = x.slice(s![5..6, .., ..]).to_owned();
    let single = conv.forward(&row.view(), 1, 1).unwrap();
    for (a, b) in full.slice(s![5, .., ..]).iter().zip(single.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
}

#[test]
fn test_weight_norm_per_output_channel() {
    // v[:, :, 0] = [3, 4] (norm 5), v[:, :, 1] = [0, 2] (norm 2)
    let v = Array3::from_shape_vec((2, 1, 2), vec![3.0, 0.0, 4.0, 2.0]).unwrap();
    let g = arr1(&[10.0, 1.0]);
    let w = weight_norm_out_channels(&g, &v).unwrap();
    assert_abs_diff_eq!(w[[0, 0, 0]], 6.0, epsilon = 1e-6);
    assert_abs_diff_eq!(w[[1, 0, 0]], 8.0, epsilon = 1e-6);
    assert_abs_diff_eq!(w[[0, 0, 1]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(w[[1, 0, 1]], 1.0, epsilon = 1e-6);
    assert!(weight_norm_out_channels(&arr1(&[1.0]), &v).is_err());
}

#[test]
fn test_from_weights_weight_norm() {
    let mut state = MemoryLoader::new();
    state.insert(
        "decoder.convolutions.0.weight_v",
        Array3::from_shape_vec((2, 1, 1), vec![3.0, 4.0]).unwrap(),
    );
    state.insert(
        "decoder.convolutions.0.weight_g",
        Array3::from_shape_vec((1, 1, 1), vec![5.0]).unwrap(),
    );
    state.insert("decoder.convolutions.0.bias", arr1(&[0.0]));
    let weights = ModelWeights::from_loader(state);

    let conv = LinearizedConvolution::from_weights(&weights, "decoder.convolutions.0").unwrap();
    assert_eq!(conv.kernel_size(), 2);
    assert_abs_diff_eq!(conv.conv.weight[[1, 0, 0]], 4.0, epsilon = 1e-6);
}

#[test]
fn test_random_init_std() {
    let mut rng = StdRng::seed_from_u64(3);
    let conv = ConvTbc::random(100, 200, 5, 0.2, &mut rng).unwrap();
    let expected = (4.0f32 * 0.8 / 500.0).sqrt();
    let n = conv.weight.len() as f32;
    let mean = conv.weight.sum() / n;
    let std = (conv.weight.mapv(|v| (v - mean) * (v - mean)).sum() / n).sqrt();
    assert_abs_diff_eq!(mean, 0.0, epsilon = 2e-3);
    assert_abs_diff_eq!(std, expected, epsilon = 2e-3);
    assert!(conv.bias.iter().all(|&b| b == 0.0));
}

#[test]
fn test_linearized_is_causal() {
    let conv = LinearizedConvolution::new(tiny_conv());
    let x = Array3::from_shape_vec((1, 3, 1), vec![1.0, 2.0, 3.0]).unwrap();
    let out = conv.forward(&x.view()).unwrap();
    // y[t] = 1*x[t-1] + 10*x[t] + 0.5
    assert_eq!(out.shape(), &[1, 3, 1]);
    assert_abs_diff_eq!(out[[0, 0, 0]], 10.5);
    assert_abs_diff_eq!(out[[0, 1, 0]], 21.5);
    assert_abs_diff_eq!(out[[0, 2, 0]], 32.5);
}

#[test]
fn test_linearized_incremental_matches_full() {
    let mut rng = StdRng::seed_from_u64(5);
    for kernel in [1usize, 3, 4] {
        let conv = LinearizedConvolution::random(6, 10, kernel, 0.0, &mut rng).unwrap();
        let x = Array3::random_using((2, 7, 6), Uniform::new(-1.0f32, 1.0), &mut rng);
        let full = conv.forward(&x.view()).unwrap();

        let mut buffer = None;
        for t in 0..7 {
            // Pass the whole prefix; only its last step is consumed.
            let prefix = x.slice(s![.., ..=t, ..]);
            let step = conv.forward_step(&prefix, &mut buffer).unwrap();
            assert_eq!(step.shape(), &[2, 1, 10]);
            for b in 0..2 {
                for c in 0..10 {
                    assert_abs_diff_eq!(step[[b, 0, c]], full[[b, t, c]], epsilon = 1e-5);
                }
            }
        }
    }
}

#[test]
fn test_linearized_buffer_batch_mismatch() {
    let conv = LinearizedConvolution::new(tiny_conv());
    let mut buffer = None;
    conv.forward_step(&Array3::zeros((2, 1, 1)).view(), &mut buffer).unwrap();
    assert!(conv.forward_step(&Array3::zeros((3, 1, 1)).view(), &mut buffer).is_err());
}
