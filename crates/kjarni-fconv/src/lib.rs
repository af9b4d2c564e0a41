//! Topic-conditioned convolutional sequence-to-sequence model.
//!
//! This crate provides the forward computation graph of a fully convolutional
//! encoder-decoder with attention, whose word embeddings are conditioned on
//! document and word topic vectors. Every convolutional block uses gated
//! linear units, either the classic GLU or the NGTU variant (tanh-gated GLU
//! followed by a shared layer normalization).
//!
//! The decoder runs in two modes: a full-sequence pass over all target
//! positions, and an incremental pass that consumes one token per call and
//! keeps its convolution windows in an [`IncrementalState`].

pub mod activations;
pub mod attention;
pub mod cache;
pub mod config;
pub mod conv;
pub mod decoder;
pub mod dropout;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod linear_layer;
pub mod model;
pub mod normalization;
pub mod weights;

// Re-export commonly used items
pub use crate::{
    attention::AttentionLayer,
    cache::{Cache, IncrementalState},
    config::{Architecture, ConvSpec, FConvArgs, FConvConfig, Gating},
    decoder::{DecoderOutput, FConvDecoder},
    encoder::{EncoderOut, FConvEncoder},
    error::FConvError,
    model::{FConvModel, Seq2SeqBatch},
    weights::{MemoryLoader, ModelWeights, SafeTensorsLoader, WeightLoader},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::{Cache, IncrementalState};
    pub use crate::config::{Architecture, FConvArgs, FConvConfig};
    pub use crate::model::{FConvModel, Seq2SeqBatch};
}
