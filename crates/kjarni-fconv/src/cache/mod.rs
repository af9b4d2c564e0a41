//! Inference state carried between incremental decoder calls.

mod incremental;

pub use incremental::IncrementalState;

use std::any::Any;

/// A type-erased, thread-safe container for mutable inference state.
pub trait Cache: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Number of decoded steps held by the cache.
    fn get_seq_length(&self) -> usize;
    fn set_seq_length(&mut self, len: usize);
    fn clear(&mut self);
    fn increment_len(&mut self, new_tokens_len: usize);
    fn clone_box(&self) -> Box<dyn Cache>;
}

#[cfg(test)]
mod tests;
