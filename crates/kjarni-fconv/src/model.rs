//! The full encoder-decoder model.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use rand::Rng;

use crate::activations::{log_softmax_last_axis, softmax_last_axis};
use crate::cache::IncrementalState;
use crate::config::FConvConfig;
use crate::decoder::{DecoderOutput, FConvDecoder};
use crate::encoder::{EncoderOut, FConvEncoder};
use crate::error::FConvError;
use crate::weights::{MemoryLoader, ModelWeights};

/// One training or scoring batch.
#[derive(Debug, Clone)]
pub struct Seq2SeqBatch {
    /// `[B, S]`
    pub src_tokens: Array2<u32>,
    pub src_lengths: Vec<usize>,
    /// `[B, K]`
    pub src_doctopic: Array2<f32>,
    /// `[B, S, K]`
    pub src_wordtopics: Array3<f32>,
    /// `[B, T]`, the target shifted right by one step.
    pub prev_output_tokens: Array2<u32>,
}

pub struct FConvModel {
    config: FConvConfig,
    pub encoder: FConvEncoder,
    pub decoder: FConvDecoder,
}

impl FConvModel {
    /// Builds a randomly initialised model.
    ///
    /// `pretrained` holds one word vector per source token; its first
    /// `config.embed_dim` columns become the encoder token embeddings.
    pub fn build<R: Rng + ?Sized>(
        config: FConvConfig,
        src_vocab: usize,
        tgt_vocab: usize,
        pretrained: &ArrayView2<f32>,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        if pretrained.nrows() != src_vocab {
            return Err(FConvError::shape(
                "pretrained embeddings",
                format!("[{}, >= {}]", src_vocab, config.embed_dim),
                pretrained.shape(),
            )
            .into());
        }
        let encoder = FConvEncoder::build(&config, pretrained, rng)?;
        let decoder = FConvDecoder::build(&config, tgt_vocab, rng)?;
        log::info!(
            "built fconv model: embed_dim={}, topic_dim={}, {} encoder / {} decoder layers, {} attention, gating={}",
            config.embed_dim,
            config.topic_dim,
            encoder.num_layers(),
            decoder.num_layers(),
            decoder.num_attention_layers(),
            config.gating
        );
        Ok(Self {
            config,
            encoder,
            decoder,
        })
    }

    /// Loads a model from a checkpoint that uses the `encoder.*` / `decoder.*`
    /// state-dict naming.
    pub fn from_weights(config: FConvConfig, weights: &ModelWeights) -> Result<Self> {
        config.validate()?;
        let encoder = FConvEncoder::from_weights(&config, weights).context("failed to load encoder")?;
        let decoder = FConvDecoder::from_weights(&config, weights).context("failed to load decoder")?;
        log::info!(
            "loaded fconv model from {} tensors (src vocab {}, tgt vocab {})",
            weights.names().len(),
            encoder.embed_tokens.num_embeddings(),
            decoder.vocab_size()
        );
        Ok(Self {
            config,
            encoder,
            decoder,
        })
    }

    /// Loads `config.json` and the safetensors weights from a directory.
    pub fn from_dir(path: &Path) -> Result<Self> {
        let config = FConvConfig::from_file(&path.join("config.json"))?;
        let weights = ModelWeights::new(path)?;
        Self::from_weights(config, &weights)
    }

    /// Collects every parameter under its checkpoint name. Weight-normalized
    /// layers are written with their folded weight.
    pub fn state_dict(&self) -> MemoryLoader {
        let mut state = MemoryLoader::new();
        self.encoder.export(&mut state);
        self.decoder.export(&mut state);
        state
    }

    /// Writes `config.json` and `model.safetensors` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
        let json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(dir.join("config.json"), json)?;
        self.state_dict().save_safetensors(&dir.join("model.safetensors"))
    }

    pub fn config(&self) -> &FConvConfig {
        &self.config
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }

    /// `(max source positions, max target positions)`
    pub fn max_positions(&self) -> (usize, usize) {
        (self.encoder.max_positions(), self.decoder.max_positions())
    }

    /// Full teacher-forced pass over a batch.
    pub fn forward(&self, batch: &Seq2SeqBatch) -> Result<DecoderOutput> {
        let encoder_out = self.encode(
            &batch.src_tokens.view(),
            &batch.src_lengths,
            &batch.src_doctopic.view(),
            &batch.src_wordtopics.view(),
        )?;
        self.decoder.forward(
            &batch.prev_output_tokens.view(),
            &encoder_out,
            &batch.src_doctopic.view(),
            None,
        )
    }

    pub fn encode(
        &self,
        src_tokens: &ArrayView2<u32>,
        src_lengths: &[usize],
        src_doctopic: &ArrayView2<f32>,
        src_wordtopics: &ArrayView3<f32>,
    ) -> Result<EncoderOut> {
        self.encoder.forward(src_tokens, src_lengths, src_doctopic, src_wordtopics)
    }

    pub fn new_incremental_state(&self) -> IncrementalState {
        self.decoder.new_incremental_state()
    }

    /// Scores the next token given the prefix `prev_tokens [B, T]`.
    pub fn decode_step(
        &self,
        prev_tokens: &ArrayView2<u32>,
        encoder_out: &EncoderOut,
        src_doctopic: &ArrayView2<f32>,
        state: &mut IncrementalState,
    ) -> Result<DecoderOutput> {
        self.decoder.forward(prev_tokens, encoder_out, src_doctopic, Some(state))
    }

    pub fn reorder_incremental_state(&self, state: &mut IncrementalState, new_order: &[usize]) -> Result<()> {
        self.decoder.reorder_incremental_state(state, new_order)
    }

    /// Softmax (or log-softmax) over the vocabulary axis.
    pub fn normalized_probs(&self, logits: &Array3<f32>, log_probs: bool) -> Array3<f32> {
        let mut probs = logits.clone();
        if log_probs {
            log_softmax_last_axis(&mut probs);
        } else {
            softmax_last_axis(&mut probs);
        }
        probs
    }
}
