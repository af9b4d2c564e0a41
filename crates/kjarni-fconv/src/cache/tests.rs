use ndarray::{Array3, s};

use super::*;

fn filled(batch: usize, value_of_row: impl Fn(usize) -> f32) -> Array3<f32> {
    let mut a = Array3::<f32>::zeros((batch, 2, 3));
    for b in 0..batch {
        a.slice_mut(s![b, .., ..]).fill(value_of_row(b));
    }
    a
}

#[test]
fn test_new_state_is_empty() {
    let state = IncrementalState::new(3);
    assert_eq!(state.num_layers(), 3);
    assert_eq!(state.get_seq_length(), 0);
    assert!(state.batch_size().is_none());
    assert!(state.encoder_out().is_none());
    assert!(state.conv_buffer(0).is_none());
}

#[test]
fn test_conv_buffer_bounds() {
    let mut state = IncrementalState::new(2);
    *state.conv_buffer_mut(1).unwrap() = Some(filled(2, |b| b as f32));
    assert_eq!(state.batch_size(), Some(2));
    assert!(state.conv_buffer_mut(2).is_err());
}

#[test]
fn test_reorder_selects_rows_everywhere() {
    let mut state = IncrementalState::new(2);
    *state.conv_buffer_mut(0).unwrap() = Some(filled(3, |b| b as f32));
    *state.conv_buffer_mut(1).unwrap() = Some(filled(3, |b| 10.0 + b as f32));
    state.set_encoder_out(filled(3, |b| 100.0 + b as f32), filled(3, |b| 200.0 + b as f32));

    state.reorder(&[2, 2, 0, 1]).unwrap();

    let buf0 = state.conv_buffer(0).unwrap();
    assert_eq!(buf0.dim().0, 4);
    assert_eq!(buf0[[0, 0, 0]], 2.0);
    assert_eq!(buf0[[1, 1, 2]], 2.0);
    assert_eq!(buf0[[2, 0, 0]], 0.0);
    assert_eq!(state.conv_buffer(1).unwrap()[[3, 0, 0]], 11.0);

    let (a, b) = state.encoder_out().unwrap();
    assert_eq!(a[[0, 0, 0]], 102.0);
    assert_eq!(b[[2, 1, 1]], 200.0);
    assert_eq!(state.batch_size(), Some(4));
}

#[test]
fn test_reorder_out_of_bounds() {
    let mut state = IncrementalState::new(1);
    *state.conv_buffer_mut(0).unwrap() = Some(filled(2, |_| 0.0));
    assert!(state.reorder(&[0, 2]).is_err());
    // Empty state accepts any order.
    assert!(IncrementalState::new(1).reorder(&[5]).is_ok());
}

#[test]
fn test_cache_trait_object() {
    let mut state = IncrementalState::new(1);
    *state.conv_buffer_mut(0).unwrap() = Some(filled(1, |_| 1.0));
    state.increment_len(3);

    let boxed: Box<dyn Cache> = state.clone_box();
    assert_eq!(boxed.get_seq_length(), 3);
    let restored = boxed.as_any().downcast_ref::<IncrementalState>().unwrap();
    assert!(restored.conv_buffer(0).is_some());

    state.clear();
    assert_eq!(state.get_seq_length(), 0);
    assert!(state.conv_buffer(0).is_none());
    assert_eq!(state.num_layers(), 1);

    state.set_seq_length(7);
    assert_eq!(state.get_seq_length(), 7);
    assert!(state.as_any_mut().downcast_mut::<IncrementalState>().is_some());
}
