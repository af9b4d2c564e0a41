//! Convolutional decoder with per-layer attention.
//!
//! The decoder runs either over a whole target prefix at once, or one token
//! per call with its convolution windows held in an [`IncrementalState`].
//! Both paths compute the same values for the same prefix.

use anyhow::{Context, Result, anyhow};
use ndarray::{Array1, Array3, ArrayView2, ArrayView3, Axis, concatenate, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use rand::Rng;

use crate::attention::AttentionLayer;
use crate::cache::{Cache, IncrementalState};
use crate::config::{FConvConfig, Gating};
use crate::conv::LinearizedConvolution;
use crate::dropout::Dropout;
use crate::embeddings::{Embedding, LearnedPositionalEmbedding};
use crate::encoder::{EncoderOut, expect_linear, new_lay_norm};
use crate::error::FConvError;
use crate::linear_layer::LinearLayer;
use crate::normalization::LayerNorm;
use crate::weights::{MemoryLoader, ModelWeights};

/// Decoder result.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, T, vocab]` unnormalized scores; `T = 1` in incremental mode.
    pub logits: Array3<f32>,
    /// `[B, T, S]` attention averaged over layers, `None` without attention.
    pub attn: Option<Array3<f32>>,
}

pub struct FConvDecoder {
    pub embed_tokens: Embedding,
    pub embed_positions: LearnedPositionalEmbedding,
    pub fc1: LinearLayer,
    pub projections: Vec<Option<LinearLayer>>,
    pub convolutions: Vec<LinearizedConvolution>,
    pub attention: Vec<Option<AttentionLayer>>,
    pub fc2: LinearLayer,
    /// Output projection. Its weight is a copy of `embed_tokens.weight` when
    /// input and output embeddings are shared.
    pub fc3: LinearLayer,
    pub lay_norm: Option<LayerNorm>,
    dropout: Dropout,
    gating: Gating,
    embed_dim: usize,
    topic_dim: usize,
    share_input_output_embed: bool,
    training: bool,
}

impl FConvDecoder {
    pub fn build<R: Rng + ?Sized>(config: &FConvConfig, vocab_size: usize, rng: &mut R) -> Result<Self> {
        let embed_tokens = Embedding::random(vocab_size, config.embed_dim, rng)?;
        let embed_positions = LearnedPositionalEmbedding::random(
            config.max_target_positions,
            config.embed_dim,
            config.padding_idx,
            config.left_pad_target,
            rng,
        )?;

        let mut in_channels = config.decoder_layers[0].out_channels;
        let fc1 = LinearLayer::random(config.augmented_dim(), in_channels, config.dropout, rng)?;
        let num_layers = config.decoder_layers.len();
        let mut projections = Vec::with_capacity(num_layers);
        let mut convolutions = Vec::with_capacity(num_layers);
        let mut attention = Vec::with_capacity(num_layers);
        for (spec, &attend) in config.decoder_layers.iter().zip(&config.decoder_attention) {
            projections.push(if in_channels != spec.out_channels {
                Some(LinearLayer::random(in_channels, spec.out_channels, 0.0, rng)?)
            } else {
                None
            });
            convolutions.push(LinearizedConvolution::random(
                in_channels,
                spec.out_channels * 2,
                spec.kernel_size,
                config.dropout,
                rng,
            )?);
            attention.push(if attend {
                Some(AttentionLayer::random(spec.out_channels, config.augmented_dim(), rng)?)
            } else {
                None
            });
            in_channels = spec.out_channels;
        }

        let fc2 = LinearLayer::random(in_channels, config.decoder_out_embed_dim, 0.0, rng)?;
        let fc3 = if config.share_input_output_embed {
            let bound = 1.0 / (config.decoder_out_embed_dim as f32).sqrt();
            let bias = Array1::random_using(vocab_size, Uniform::new(-bound, bound), rng);
            LinearLayer::new(embed_tokens.weight.clone(), bias)
        } else {
            LinearLayer::random(config.decoder_out_embed_dim, vocab_size, config.dropout, rng)?
        };

        Ok(Self {
            embed_tokens,
            embed_positions,
            fc1,
            projections,
            convolutions,
            attention,
            fc2,
            fc3,
            lay_norm: new_lay_norm(config),
            dropout: Dropout::new(config.dropout),
            gating: config.gating,
            embed_dim: config.embed_dim,
            topic_dim: config.topic_dim,
            share_input_output_embed: config.share_input_output_embed,
            training: false,
        })
    }

    pub fn from_weights(config: &FConvConfig, weights: &ModelWeights) -> Result<Self> {
        let embed_tokens = Embedding::from_weights(weights, "decoder.embed_tokens.weight")?;
        if embed_tokens.dim() != config.embed_dim {
            return Err(FConvError::shape(
                "decoder.embed_tokens.weight",
                format!("[.., {}]", config.embed_dim),
                embed_tokens.weight.shape(),
            )
            .into());
        }
        let embed_positions = LearnedPositionalEmbedding::from_weights(
            weights,
            "decoder.embed_positions.weight",
            config.padding_idx,
            config.left_pad_target,
        )?;

        let mut in_channels = config.decoder_layers[0].out_channels;
        let fc1 = LinearLayer::from_weights(weights, "decoder.fc1")?;
        expect_linear("decoder.fc1", &fc1, config.augmented_dim(), in_channels)?;

        let num_layers = config.decoder_layers.len();
        let mut projections = Vec::with_capacity(num_layers);
        let mut convolutions = Vec::with_capacity(num_layers);
        let mut attention = Vec::with_capacity(num_layers);
        for (i, (spec, &attend)) in config
            .decoder_layers
            .iter()
            .zip(&config.decoder_attention)
            .enumerate()
        {
            projections.push(if in_channels != spec.out_channels {
                let name = format!("decoder.projections.{}", i);
                let proj = LinearLayer::from_weights(weights, &name)?;
                expect_linear(&name, &proj, in_channels, spec.out_channels)?;
                Some(proj)
            } else {
                None
            });

            let name = format!("decoder.convolutions.{}", i);
            let conv = LinearizedConvolution::from_weights(weights, &name)
                .with_context(|| format!("failed to load {}", name))?;
            let expected = (spec.kernel_size, in_channels, spec.out_channels * 2);
            if conv.conv.weight.dim() != expected {
                return Err(FConvError::shape(name, format!("{:?}", expected), conv.conv.weight.shape()).into());
            }
            convolutions.push(conv);

            attention.push(if attend {
                let name = format!("decoder.attention.{}", i);
                let layer = AttentionLayer::from_weights(weights, &name)?;
                expect_linear(
                    &format!("{}.in_projection", name),
                    &layer.in_projection,
                    spec.out_channels,
                    config.augmented_dim(),
                )?;
                Some(layer)
            } else {
                None
            });
            in_channels = spec.out_channels;
        }

        let fc2 = LinearLayer::from_weights(weights, "decoder.fc2")?;
        expect_linear("decoder.fc2", &fc2, in_channels, config.decoder_out_embed_dim)?;

        let fc3 = if config.share_input_output_embed {
            let bias = weights.get_array1("decoder.fc3.bias")?;
            LinearLayer::new(embed_tokens.weight.clone(), bias)
        } else {
            LinearLayer::from_weights(weights, "decoder.fc3")?
        };
        expect_linear("decoder.fc3", &fc3, config.decoder_out_embed_dim, embed_tokens.num_embeddings())?;
        if fc3.bias.as_ref().map(|b| b.len()) != Some(embed_tokens.num_embeddings()) {
            return Err(anyhow!("decoder.fc3.bias must have one entry per target token"));
        }

        let lay_norm = match config.gating {
            Gating::Ngtu => Some(LayerNorm::from_weights(weights, "decoder.lay_norm", config.layer_norm_eps)?),
            Gating::Glu => None,
        };

        Ok(Self {
            embed_tokens,
            embed_positions,
            fc1,
            projections,
            convolutions,
            attention,
            fc2,
            fc3,
            lay_norm,
            dropout: Dropout::new(config.dropout),
            gating: config.gating,
            embed_dim: config.embed_dim,
            topic_dim: config.topic_dim,
            share_input_output_embed: config.share_input_output_embed,
            training: false,
        })
    }

    pub fn export(&self, state: &mut MemoryLoader) {
        self.embed_tokens.export("decoder.embed_tokens.weight", state);
        self.embed_positions.export("decoder.embed_positions.weight", state);
        self.fc1.export("decoder.fc1", state);
        for (i, ((proj, conv), attention)) in self
            .projections
            .iter()
            .zip(&self.convolutions)
            .zip(&self.attention)
            .enumerate()
        {
            if let Some(proj) = proj {
                proj.export(&format!("decoder.projections.{}", i), state);
            }
            conv.export(&format!("decoder.convolutions.{}", i), state);
            if let Some(attention) = attention {
                attention.export(&format!("decoder.attention.{}", i), state);
            }
        }
        self.fc2.export("decoder.fc2", state);
        self.fc3.export("decoder.fc3", state);
        if let Some(norm) = &self.lay_norm {
            norm.export("decoder.lay_norm", state);
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn max_positions(&self) -> usize {
        self.embed_positions.max_positions()
    }

    pub fn num_layers(&self) -> usize {
        self.convolutions.len()
    }

    pub fn num_attention_layers(&self) -> usize {
        self.attention.iter().filter(|a| a.is_some()).count()
    }

    pub fn vocab_size(&self) -> usize {
        self.fc3.out_features()
    }

    pub fn shares_input_output_embed(&self) -> bool {
        self.share_input_output_embed
    }

    /// Fresh state for step-by-step decoding.
    pub fn new_incremental_state(&self) -> IncrementalState {
        IncrementalState::new(self.num_layers())
    }

    /// Runs the decoder.
    ///
    /// Without `incremental_state` all `T` target positions are scored. With
    /// it, only the last token of `prev_output_tokens` is fed, the conv
    /// windows and split encoder output are kept in the state, and the
    /// result has a single time step.
    pub fn forward(
        &self,
        prev_output_tokens: &ArrayView2<u32>,
        encoder_out: &EncoderOut,
        src_doctopic: &ArrayView2<f32>,
        incremental_state: Option<&mut IncrementalState>,
    ) -> Result<DecoderOutput> {
        let (batch, time) = prev_output_tokens.dim();
        if batch == 0 || time == 0 {
            return Err(FConvError::shape("prev_output_tokens", "[B >= 1, T >= 1]", prev_output_tokens.shape()).into());
        }
        if src_doctopic.dim() != (batch, self.topic_dim) {
            return Err(FConvError::shape(
                "src_doctopic",
                format!("[{}, {}]", batch, self.topic_dim),
                src_doctopic.shape(),
            )
            .into());
        }

        match incremental_state {
            Some(state) => {
                if state.num_layers() != self.num_layers() {
                    return Err(anyhow!(
                        "incremental state has {} layers, decoder has {}",
                        state.num_layers(),
                        self.num_layers()
                    ));
                }
                if state.encoder_out().is_none() {
                    let encoder_a_t = transpose_encoder_out(encoder_out, batch)?;
                    state.set_encoder_out(encoder_a_t, encoder_out.combined.clone());
                }
                let (cached, buffers) = state.encoder_and_buffers();
                let (encoder_a_t, encoder_b) = cached.ok_or_else(|| anyhow!("encoder output missing from state"))?;
                if encoder_a_t.dim().0 != batch {
                    return Err(FConvError::shape(
                        "cached encoder output",
                        format!("[{}, .., ..]", batch),
                        encoder_a_t.shape(),
                    )
                    .into());
                }
                let out = self.run(
                    prev_output_tokens,
                    &encoder_a_t.view(),
                    &encoder_b.view(),
                    src_doctopic,
                    Some(buffers),
                )?;
                state.increment_len(1);
                Ok(out)
            }
            None => {
                let encoder_a_t = transpose_encoder_out(encoder_out, batch)?;
                self.run(
                    prev_output_tokens,
                    &encoder_a_t.view(),
                    &encoder_out.combined.view(),
                    src_doctopic,
                    None,
                )
            }
        }
    }

    /// Selects batch rows of the state to follow a beam reordering.
    pub fn reorder_incremental_state(&self, state: &mut IncrementalState, new_order: &[usize]) -> Result<()> {
        state.reorder(new_order)
    }

    fn run(
        &self,
        tokens: &ArrayView2<u32>,
        encoder_a_t: &ArrayView3<f32>,
        encoder_b: &ArrayView3<f32>,
        src_doctopic: &ArrayView2<f32>,
        mut buffers: Option<&mut [Option<Array3<f32>>]>,
    ) -> Result<DecoderOutput> {
        let incremental = buffers.is_some();
        let (batch, time) = tokens.dim();
        log::debug!(
            "decoder forward: batch={}, tgt_len={}, incremental={}",
            batch,
            time,
            incremental
        );

        let embed_input = if incremental {
            tokens.slice(s![.., time - 1..])
        } else {
            tokens.view()
        };
        let mut x = self.embed_tokens.forward(&embed_input)?;
        x += &self.embed_positions.forward(tokens, incremental)?;

        let steps = x.dim().1;
        let doctopic = src_doctopic.insert_axis(Axis(1));
        let doctopic = doctopic
            .broadcast((batch, steps, self.topic_dim))
            .ok_or_else(|| anyhow!("cannot broadcast doctopic over {} steps", steps))?;
        let x = concatenate(Axis(2), &[x.view(), doctopic])?;

        let x = self.dropout.forward(x, self.training);
        let target_embedding = x.clone();

        let mut x = self.fc1.forward(&x.view())?;

        // Scores are averaged over every layer slot, attended or not.
        let num_layers = self.attention.len() as f32;
        let mut avg_attn: Option<Array3<f32>> = None;

        for (i, ((proj, conv), attention)) in self
            .projections
            .iter()
            .zip(&self.convolutions)
            .zip(&self.attention)
            .enumerate()
        {
            let residual = match proj {
                Some(proj) => proj.forward(&x.view())?,
                None => x.clone(),
            };

            x = self.dropout.forward(x, self.training);
            x = match buffers.as_deref_mut() {
                Some(buffers) => conv.forward_step(&x.view(), &mut buffers[i])?,
                None => conv.forward(&x.view())?,
            };
            x = self.gating.activate(&x.view(), self.embed_dim)?;

            if let Some(attention) = attention {
                let (out, mut attn) =
                    attention.forward(&x.view(), &target_embedding.view(), encoder_a_t, encoder_b)?;
                x = out;
                attn /= num_layers;
                match avg_attn.as_mut() {
                    Some(total) => *total += &attn,
                    None => avg_attn = Some(attn),
                }
            }

            x = self.gating.combine(x, &residual, self.lay_norm.as_ref())?;
        }

        let x = self.fc2.forward(&x.view())?;
        let x = self.dropout.forward(x, self.training);
        let logits = self.fc3.forward(&x.view())?;

        Ok(DecoderOutput {
            logits,
            attn: avg_attn,
        })
    }
}

/// Returns `conved^T [B, D, S]`; `combined` is used as is.
fn transpose_encoder_out(encoder_out: &EncoderOut, batch: usize) -> Result<Array3<f32>> {
    if encoder_out.batch_size() != batch || encoder_out.conved.dim() != encoder_out.combined.dim() {
        return Err(FConvError::shape(
            "encoder output",
            format!("[{}, S, D] for both tensors", batch),
            encoder_out.conved.shape(),
        )
        .into());
    }
    let encoder_a_t = encoder_out
        .conved
        .view()
        .permuted_axes([0, 2, 1])
        .as_standard_layout()
        .into_owned();
    Ok(encoder_a_t)
}
