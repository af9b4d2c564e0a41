//! Convolutional encoder with topic-augmented embeddings.

use std::f32::consts::FRAC_1_SQRT_2;

use anyhow::{Context, Result};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis, concatenate};
use rand::Rng;

use crate::config::{FConvConfig, Gating};
use crate::conv::ConvTbc;
use crate::dropout::Dropout;
use crate::embeddings::{Embedding, LearnedPositionalEmbedding};
use crate::error::FConvError;
use crate::linear_layer::LinearLayer;
use crate::normalization::LayerNorm;
use crate::weights::{MemoryLoader, ModelWeights};

/// Encoder output consumed by the decoder attention.
#[derive(Debug, Clone)]
pub struct EncoderOut {
    /// Output of the final projection, `[B, S, E + K]`; attention keys.
    pub conved: Array3<f32>,
    /// `(conved + input_embedding) * sqrt(0.5)`, `[B, S, E + K]`; attention values.
    pub combined: Array3<f32>,
}

impl EncoderOut {
    pub fn batch_size(&self) -> usize {
        self.conved.dim().0
    }

    pub fn src_len(&self) -> usize {
        self.conved.dim().1
    }

    /// Selects batch rows, e.g. to expand each source sentence into a beam.
    pub fn reorder(&self, new_order: &[usize]) -> Result<Self> {
        if let Some(&bad) = new_order.iter().find(|&&i| i >= self.batch_size()) {
            anyhow::bail!("reorder index {} out of bounds for batch of {}", bad, self.batch_size());
        }
        Ok(Self {
            conved: self.conved.select(Axis(0), new_order),
            combined: self.combined.select(Axis(0), new_order),
        })
    }
}

pub struct FConvEncoder {
    pub embed_tokens: Embedding,
    pub embed_positions: LearnedPositionalEmbedding,
    pub fc1: LinearLayer,
    pub projections: Vec<Option<LinearLayer>>,
    pub convolutions: Vec<ConvTbc>,
    pub fc2: LinearLayer,
    /// Shared by every block; present only for NGTU gating.
    pub lay_norm: Option<LayerNorm>,
    dropout: Dropout,
    gating: Gating,
    embed_dim: usize,
    topic_dim: usize,
    training: bool,
}

impl FConvEncoder {
    /// Random encoder whose token table comes from `pretrained`.
    pub fn build<R: Rng + ?Sized>(
        config: &FConvConfig,
        pretrained: &ArrayView2<f32>,
        rng: &mut R,
    ) -> Result<Self> {
        let embed_tokens = Embedding::from_pretrained(pretrained, config.embed_dim)?;
        let embed_positions = LearnedPositionalEmbedding::random(
            config.max_source_positions,
            config.embed_dim,
            config.padding_idx,
            config.left_pad_source,
            rng,
        )?;

        let mut in_channels = config.encoder_layers[0].out_channels;
        let fc1 = LinearLayer::random(config.augmented_dim(), in_channels, config.dropout, rng)?;
        let mut projections = Vec::with_capacity(config.encoder_layers.len());
        let mut convolutions = Vec::with_capacity(config.encoder_layers.len());
        for spec in &config.encoder_layers {
            projections.push(if in_channels != spec.out_channels {
                Some(LinearLayer::random(in_channels, spec.out_channels, 0.0, rng)?)
            } else {
                None
            });
            convolutions.push(ConvTbc::random(
                in_channels,
                spec.out_channels * 2,
                spec.kernel_size,
                config.dropout,
                rng,
            )?);
            in_channels = spec.out_channels;
        }
        let fc2 = LinearLayer::random(in_channels, config.augmented_dim(), 0.0, rng)?;

        Ok(Self {
            embed_tokens,
            embed_positions,
            fc1,
            projections,
            convolutions,
            fc2,
            lay_norm: new_lay_norm(config),
            dropout: Dropout::new(config.dropout),
            gating: config.gating,
            embed_dim: config.embed_dim,
            topic_dim: config.topic_dim,
            training: false,
        })
    }

    pub fn from_weights(config: &FConvConfig, weights: &ModelWeights) -> Result<Self> {
        let embed_tokens = Embedding::from_weights(weights, "encoder.embed_tokens.weight")?;
        if embed_tokens.dim() != config.embed_dim {
            return Err(FConvError::shape(
                "encoder.embed_tokens.weight",
                format!("[.., {}]", config.embed_dim),
                embed_tokens.weight.shape(),
            )
            .into());
        }
        let embed_positions = LearnedPositionalEmbedding::from_weights(
            weights,
            "encoder.embed_positions.weight",
            config.padding_idx,
            config.left_pad_source,
        )?;

        let fc1 = LinearLayer::from_weights(weights, "encoder.fc1")?;
        expect_linear("encoder.fc1", &fc1, config.augmented_dim(), config.encoder_layers[0].out_channels)?;

        let mut in_channels = config.encoder_layers[0].out_channels;
        let mut projections = Vec::with_capacity(config.encoder_layers.len());
        let mut convolutions = Vec::with_capacity(config.encoder_layers.len());
        for (i, spec) in config.encoder_layers.iter().enumerate() {
            projections.push(if in_channels != spec.out_channels {
                let name = format!("encoder.projections.{}", i);
                let proj = LinearLayer::from_weights(weights, &name)?;
                expect_linear(&name, &proj, in_channels, spec.out_channels)?;
                Some(proj)
            } else {
                None
            });
            let name = format!("encoder.convolutions.{}", i);
            let conv = ConvTbc::from_weights(weights, &name)
                .with_context(|| format!("failed to load {}", name))?;
            let expected = (spec.kernel_size, in_channels, spec.out_channels * 2);
            if conv.weight.dim() != expected {
                return Err(FConvError::shape(name, format!("{:?}", expected), conv.weight.shape()).into());
            }
            convolutions.push(conv);
            in_channels = spec.out_channels;
        }

        let fc2 = LinearLayer::from_weights(weights, "encoder.fc2")?;
        expect_linear("encoder.fc2", &fc2, in_channels, config.augmented_dim())?;

        let lay_norm = match config.gating {
            Gating::Ngtu => Some(LayerNorm::from_weights(weights, "encoder.lay_norm", config.layer_norm_eps)?),
            Gating::Glu => None,
        };

        Ok(Self {
            embed_tokens,
            embed_positions,
            fc1,
            projections,
            convolutions,
            fc2,
            lay_norm,
            dropout: Dropout::new(config.dropout),
            gating: config.gating,
            embed_dim: config.embed_dim,
            topic_dim: config.topic_dim,
            training: false,
        })
    }

    pub fn export(&self, state: &mut MemoryLoader) {
        self.embed_tokens.export("encoder.embed_tokens.weight", state);
        self.embed_positions.export("encoder.embed_positions.weight", state);
        self.fc1.export("encoder.fc1", state);
        for (i, (proj, conv)) in self.projections.iter().zip(&self.convolutions).enumerate() {
            if let Some(proj) = proj {
                proj.export(&format!("encoder.projections.{}", i), state);
            }
            conv.export(&format!("encoder.convolutions.{}", i), state);
        }
        self.fc2.export("encoder.fc2", state);
        if let Some(norm) = &self.lay_norm {
            norm.export("encoder.lay_norm", state);
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

    /// Encodes a batch.
    ///
    /// * `src_tokens` - `[B, S]` token ids
    /// * `src_lengths` - one length per row, at most `S`
    /// * `src_doctopic` - `[B, K]` document topic distribution
    /// * `src_wordtopics` - `[B, S, K]` per-token topic vectors
    pub fn forward(
        &self,
        src_tokens: &ArrayView2<u32>,
        src_lengths: &[usize],
        src_doctopic: &ArrayView2<f32>,
        src_wordtopics: &ArrayView3<f32>,
    ) -> Result<EncoderOut> {
        self.check_inputs(src_tokens, src_lengths, src_doctopic, src_wordtopics)?;
        let (batch, src_len) = src_tokens.dim();
        log::debug!("encoder forward: batch={}, src_len={}", batch, src_len);

        // Word topics weighted by the document topic distribution.
        let topic = src_wordtopics * &src_doctopic.insert_axis(Axis(1));

        let mut x = self.embed_tokens.forward(src_tokens)?;
        x += &self.embed_positions.forward(src_tokens, false)?;
        let x = concatenate(Axis(2), &[x.view(), topic.view()])?;

        let x = self.dropout.forward(x, self.training);
        let input_embedding = x.clone();

        let mut x = self.fc1.forward(&x.view())?;
        for (proj, conv) in self.projections.iter().zip(&self.convolutions) {
            let residual = match proj {
                Some(proj) => proj.forward(&x.view())?,
                None => x.clone(),
            };
            x = self.dropout.forward(x, self.training);
            let k = conv.kernel_size();
            x = conv.forward(&x.view(), (k - 1) / 2, k / 2)?;
            x = self.gating.activate(&x.view(), self.embed_dim)?;
            x = self.gating.combine(x, &residual, self.lay_norm.as_ref())?;
        }

        // Gradient scaling by 1 / (2 * attention layers) only affects backward.
        let conved = self.fc2.forward(&x.view())?;

        let mut combined = &conved + &input_embedding;
        combined *= FRAC_1_SQRT_2;

        Ok(EncoderOut { conved, combined })
    }

    fn check_inputs(
        &self,
        src_tokens: &ArrayView2<u32>,
        src_lengths: &[usize],
        src_doctopic: &ArrayView2<f32>,
        src_wordtopics: &ArrayView3<f32>,
    ) -> Result<()> {
        let (batch, src_len) = src_tokens.dim();
        if batch == 0 || src_len == 0 {
            return Err(FConvError::shape("src_tokens", "[B >= 1, S >= 1]", src_tokens.shape()).into());
        }
        if src_lengths.len() != batch || src_lengths.iter().any(|&l| l > src_len) {
            return Err(FConvError::shape(
                "src_lengths",
                format!("[{}] with entries <= {}", batch, src_len),
                &[src_lengths.len()],
            )
            .into());
        }
        if src_doctopic.dim() != (batch, self.topic_dim) {
            return Err(FConvError::shape(
                "src_doctopic",
                format!("[{}, {}]", batch, self.topic_dim),
                src_doctopic.shape(),
            )
            .into());
        }
        if src_wordtopics.dim() != (batch, src_len, self.topic_dim) {
            return Err(FConvError::shape(
                "src_wordtopics",
                format!("[{}, {}, {}]", batch, src_len, self.topic_dim),
                src_wordtopics.shape(),
            )
            .into());
        }
        Ok(())
    }
}

pub(crate) fn new_lay_norm(config: &FConvConfig) -> Option<LayerNorm> {
    match config.gating {
        Gating::Ngtu => Some(LayerNorm::identity(config.embed_dim, config.layer_norm_eps)),
        Gating::Glu => None,
    }
}

pub(crate) fn expect_linear(name: &str, layer: &LinearLayer, in_features: usize, out_features: usize) -> Result<()> {
    if layer.weight.dim() != (out_features, in_features) {
        return Err(FConvError::shape(
            format!("{}.weight", name),
            format!("[{}, {}]", out_features, in_features),
            layer.weight.shape(),
        )
        .into());
    }
    Ok(())
}
