use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Array3, Axis, arr2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::*;

fn identity_layer() -> AttentionLayer {
    AttentionLayer {
        in_projection: LinearLayer::new(Array2::eye(2), Array1::zeros(2)),
        out_projection: LinearLayer::new(Array2::eye(2), Array1::zeros(2)),
    }
}

#[test]
fn test_attention_golden() {
    let layer = identity_layer();
    let x = Array3::from_shape_vec((1, 1, 2), vec![1.0, 0.0]).unwrap();
    let target = x.clone();
    // encoder_a rows [1, 0] and [0, 1], stored transposed as [D, S].
    let a_t = Array3::from_shape_vec((1, 2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let b = Array3::from_shape_vec((1, 2, 2), vec![2.0, 0.0, 0.0, 4.0]).unwrap();

    let (out, attn) = layer
        .forward(&x.view(), &target.view(), &a_t.view(), &b.view())
        .unwrap();

    let score = 2.0f32.sqrt();
    let p0 = score.exp() / (score.exp() + 1.0);
    let p1 = 1.0 - p0;
    assert_abs_diff_eq!(attn[[0, 0, 0]], p0, epsilon = 1e-6);
    assert_abs_diff_eq!(attn[[0, 0, 1]], p1, epsilon = 1e-6);

    let scale = 2.0 * 0.5f32.sqrt();
    let c0 = 2.0 * p0 * scale;
    let c1 = 4.0 * p1 * scale;
    assert_abs_diff_eq!(out[[0, 0, 0]], (c0 + 1.0) * 0.5f32.sqrt(), epsilon = 1e-5);
    assert_abs_diff_eq!(out[[0, 0, 1]], c1 * 0.5f32.sqrt(), epsilon = 1e-5);
}

#[test]
fn test_attention_weights_are_distributions() {
    let mut rng = StdRng::seed_from_u64(9);
    let layer = AttentionLayer::random(8, 6, &mut rng).unwrap();
    let dist = Uniform::new(-1.0f32, 1.0);
    let x = Array3::random_using((3, 4, 8), dist, &mut rng);
    let target = Array3::random_using((3, 4, 6), dist, &mut rng);
    let a_t = Array3::random_using((3, 6, 5), dist, &mut rng);
    let b = Array3::random_using((3, 5, 6), dist, &mut rng);

    let (out, attn) = layer
        .forward(&x.view(), &target.view(), &a_t.view(), &b.view())
        .unwrap();
    assert_eq!(out.shape(), &[3, 4, 8]);
    assert_eq!(attn.shape(), &[3, 4, 5]);
    for row in attn.lanes(Axis(2)) {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        assert!(row.iter().all(|&p| p >= 0.0));
    }
}

#[test]
fn test_attention_shape_errors() {
    let layer = identity_layer();
    let x = Array3::<f32>::zeros((1, 2, 2));
    let target = Array3::<f32>::zeros((1, 2, 2));
    let a_t = Array3::<f32>::zeros((1, 2, 3));
    let b = Array3::<f32>::zeros((1, 3, 2));
    assert!(layer.forward(&x.view(), &target.view(), &a_t.view(), &b.view()).is_ok());

    let bad_target = Array3::<f32>::zeros((1, 1, 2));
    assert!(layer.forward(&x.view(), &bad_target.view(), &a_t.view(), &b.view()).is_err());
    let bad_b = Array3::<f32>::zeros((1, 4, 2));
    assert!(layer.forward(&x.view(), &target.view(), &a_t.view(), &bad_b.view()).is_err());
    let empty_a = Array3::<f32>::zeros((1, 2, 0));
    let empty_b = Array3::<f32>::zeros((1, 0, 2));
    assert!(layer.forward(&x.view(), &target.view(), &empty_a.view(), &empty_b.view()).is_err());
}

#[test]
fn test_export_and_reload() {
    let mut rng = StdRng::seed_from_u64(4);
    let layer = AttentionLayer::random(4, 6, &mut rng).unwrap();
    let mut state = MemoryLoader::new();
    layer.export("decoder.attention.1", &mut state);
    assert_eq!(state.len(), 4);

    let weights = ModelWeights::from_loader(state);
    let reloaded = AttentionLayer::from_weights(&weights, "decoder.attention.1").unwrap();
    assert_eq!(reloaded.in_projection.weight, layer.in_projection.weight);
    assert_eq!(reloaded.out_projection.weight, layer.out_projection.weight);
}

#[test]
fn test_bmm_matches_per_batch_dot() {
    let mut rng = StdRng::seed_from_u64(21);
    let dist = Uniform::new(-1.0f32, 1.0);
    for batch in [2usize, 40] {
        let a = Array3::random_using((batch, 30, 7), dist, &mut rng);
        let b = Array3::random_using((batch, 7, 20), dist, &mut rng);
        let out = bmm(&a.view(), &b.view());
        for i in 0..batch {
            let expected = a.index_axis(Axis(0), i).dot(&b.index_axis(Axis(0), i));
            for (x, y) in out.index_axis(Axis(0), i).iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
            }
        }
    }
    let small = bmm(
        &Array3::from_shape_vec((1, 1, 2), vec![1.0, 2.0]).unwrap().view(),
        &Array3::from_shape_vec((1, 2, 1), vec![3.0, 4.0]).unwrap().view(),
    );
    assert_eq!(small.index_axis(Axis(0), 0), arr2(&[[11.0]]));
}
