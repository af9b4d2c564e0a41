//! Model arguments, architecture presets and the resolved configuration.

mod architectures;
mod layers;

pub use architectures::Architecture;
pub use layers::{MAX_LAYERS, parse_attention, parse_layers};

use std::f32::consts::FRAC_1_SQRT_2;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::activations::{glu, ngtu};
use crate::error::FConvError;
use crate::normalization::LayerNorm;

/// Layer count used when preset layer widths do not match the embedding width.
pub const NGTU_DEFAULT_DEPTH: usize = 20;
pub const NGTU_DEFAULT_KERNEL: usize = 3;

/// Gating nonlinearity used by every convolutional block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gating {
    /// `tanh(a) * sigmoid(b)` followed by a shared `LayerNorm(x + residual)`.
    #[default]
    Ngtu,
    /// `a * sigmoid(b)` followed by `(x + residual) * sqrt(0.5)`.
    Glu,
}

impl Gating {
    /// Gates a `[B, T, 2C]` convolution output down to `[B, T, C]`.
    /// `split` is the number of leading channels that go through tanh.
    pub fn activate(&self, x: &ArrayView3<f32>, split: usize) -> Result<Array3<f32>> {
        match self {
            Gating::Ngtu => ngtu(x, split),
            Gating::Glu => glu(x),
        }
    }

    /// Merges the gated output with the block residual.
    pub fn combine(
        &self,
        x: Array3<f32>,
        residual: &Array3<f32>,
        lay_norm: Option<&LayerNorm>,
    ) -> Result<Array3<f32>> {
        if x.dim() != residual.dim() {
            return Err(FConvError::shape(
                "residual",
                format!("{:?}", x.shape()),
                residual.shape(),
            )
            .into());
        }
        match self {
            Gating::Ngtu => {
                let norm = lay_norm.ok_or_else(|| anyhow!("ngtu gating needs a layer norm"))?;
                norm.forward(&(x + residual).view())
            }
            Gating::Glu => {
                let mut x = x + residual;
                x *= FRAC_1_SQRT_2;
                Ok(x)
            }
        }
    }
}

impl FromStr for Gating {
    type Err = FConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ngtu" => Ok(Gating::Ngtu),
            "glu" => Ok(Gating::Glu),
            other => Err(FConvError::InvalidConfig(format!("unknown gating '{}'", other))),
        }
    }
}

impl fmt::Display for Gating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gating::Ngtu => f.write_str("ngtu"),
            Gating::Glu => f.write_str("glu"),
        }
    }
}

/// One convolutional layer: output channels and kernel width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub out_channels: usize,
    pub kernel_size: usize,
}

impl ConvSpec {
    pub fn new(out_channels: usize, kernel_size: usize) -> Self {
        Self {
            out_channels,
            kernel_size,
        }
    }
}

/// Raw model arguments as supplied by a command line or a JSON file.
///
/// Fields left as `None` are filled by an [`Architecture`] preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FConvArgs {
    #[serde(default)]
    pub arch: Option<Architecture>,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub encoder_embed_dim: Option<usize>,
    #[serde(default)]
    pub encoder_layers: Option<String>,
    #[serde(default)]
    pub decoder_embed_dim: Option<usize>,
    #[serde(default)]
    pub decoder_layers: Option<String>,
    #[serde(default)]
    pub decoder_out_embed_dim: Option<usize>,
    #[serde(default)]
    pub decoder_attention: Option<String>,
    #[serde(default)]
    pub share_input_output_embed: Option<bool>,
    #[serde(default = "default_max_positions")]
    pub max_source_positions: usize,
    #[serde(default = "default_max_positions")]
    pub max_target_positions: usize,
    #[serde(default = "default_topic_dim")]
    pub topic_dim: usize,
    #[serde(default)]
    pub gating: Gating,
    #[serde(default = "default_true")]
    pub left_pad_source: bool,
    #[serde(default)]
    pub left_pad_target: bool,
    #[serde(default = "default_padding_idx")]
    pub padding_idx: u32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

fn default_dropout() -> f32 { 0.1 }
fn default_max_positions() -> usize { 1024 }
fn default_topic_dim() -> usize { 512 }
fn default_true() -> bool { true }
fn default_padding_idx() -> u32 { 1 }
fn default_layer_norm_eps() -> f32 { 1e-5 }

impl Default for FConvArgs {
    fn default() -> Self {
        Self {
            arch: None,
            dropout: default_dropout(),
            encoder_embed_dim: None,
            encoder_layers: None,
            decoder_embed_dim: None,
            decoder_layers: None,
            decoder_out_embed_dim: None,
            decoder_attention: None,
            share_input_output_embed: None,
            max_source_positions: default_max_positions(),
            max_target_positions: default_max_positions(),
            topic_dim: default_topic_dim(),
            gating: Gating::default(),
            left_pad_source: true,
            left_pad_target: false,
            padding_idx: default_padding_idx(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

/// Fully resolved model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FConvConfig {
    /// Token embedding width, shared by encoder and decoder.
    pub embed_dim: usize,
    pub topic_dim: usize,
    pub dropout: f32,
    pub encoder_layers: Vec<ConvSpec>,
    pub decoder_layers: Vec<ConvSpec>,
    pub decoder_out_embed_dim: usize,
    pub decoder_attention: Vec<bool>,
    pub share_input_output_embed: bool,
    pub max_source_positions: usize,
    pub max_target_positions: usize,
    pub gating: Gating,
    pub left_pad_source: bool,
    pub left_pad_target: bool,
    pub padding_idx: u32,
    pub layer_norm_eps: f32,
}

impl FConvConfig {
    /// Resolves `args` against its architecture preset.
    ///
    /// `embed_dim` is the width of the pretrained word vectors; it replaces
    /// the preset's encoder and decoder embedding sizes. With NGTU gating, a
    /// preset layer list whose widths differ from `embed_dim` is replaced by
    /// `[(embed_dim, 3)] * 20`.
    pub fn from_args(args: &FConvArgs, embed_dim: usize) -> Result<Self> {
        let given = args;
        let mut args = args.clone();
        let arch = args.arch.unwrap_or_default();
        arch.apply(&mut args);

        let encoder_expr = args.encoder_layers.as_deref().unwrap_or_default();
        let decoder_expr = args.decoder_layers.as_deref().unwrap_or_default();
        let mut encoder_layers = parse_layers(encoder_expr).context("invalid encoder layers")?;
        let mut decoder_layers = parse_layers(decoder_expr).context("invalid decoder layers")?;

        // Preset layer widths give way to the pretrained width under NGTU;
        // layer lists the caller wrote out are kept and validated as is.
        if args.gating == Gating::Ngtu {
            let explicit = |given: &Option<String>, resolved: &Option<String>| {
                given.is_some() && given == resolved
            };
            let fits = |layers: &[ConvSpec]| layers.iter().all(|l| l.out_channels == embed_dim);
            for (side, layers, given, resolved) in [
                ("encoder", &mut encoder_layers, &given.encoder_layers, &args.encoder_layers),
                ("decoder", &mut decoder_layers, &given.decoder_layers, &args.decoder_layers),
            ] {
                if !explicit(given, resolved) && !fits(layers.as_slice()) {
                    log::info!(
                        "{} {} layers do not match embed_dim={}, using {} layers of ({}, {})",
                        arch,
                        side,
                        embed_dim,
                        NGTU_DEFAULT_DEPTH,
                        embed_dim,
                        NGTU_DEFAULT_KERNEL
                    );
                    *layers = vec![ConvSpec::new(embed_dim, NGTU_DEFAULT_KERNEL); NGTU_DEFAULT_DEPTH];
                }
            }
        }
        let decoder_attention = parse_attention(
            args.decoder_attention.as_deref().unwrap_or("True"),
            decoder_layers.len(),
        )
        .context("invalid decoder attention")?;

        let config = Self {
            embed_dim,
            topic_dim: args.topic_dim,
            dropout: args.dropout,
            encoder_layers,
            decoder_layers,
            decoder_out_embed_dim: args.decoder_out_embed_dim.unwrap_or(256),
            decoder_attention,
            share_input_output_embed: args.share_input_output_embed.unwrap_or(false),
            max_source_positions: args.max_source_positions,
            max_target_positions: args.max_target_positions,
            gating: args.gating,
            left_pad_source: args.left_pad_source,
            left_pad_target: args.left_pad_target,
            padding_idx: args.padding_idx,
            layer_norm_eps: args.layer_norm_eps,
        };
        config.validate()?;
        log::debug!(
            "resolved {} config: embed_dim={}, {} encoder / {} decoder layers, gating={}",
            arch,
            config.embed_dim,
            config.encoder_layers.len(),
            config.decoder_layers.len(),
            config.gating
        );
        Ok(config)
    }

    /// Parses either a resolved config (as written by `FConvModel::save`) or
    /// raw arguments. For arguments, the embedding width is taken from
    /// `encoder_embed_dim` after the architecture preset is applied.
    pub fn from_json(json: &str) -> Result<Self> {
        if let Ok(config) = serde_json::from_str::<FConvConfig>(json) {
            config.validate()?;
            return Ok(config);
        }
        let args: FConvArgs = serde_json::from_str(json).context("failed to parse fconv arguments")?;
        let mut resolved = args.clone();
        resolved.arch.unwrap_or_default().apply(&mut resolved);
        let embed_dim = resolved.encoder_embed_dim.unwrap_or(512);
        Self::from_args(&args, embed_dim)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(FConvError::InvalidConfig(msg).into()) };

        if self.embed_dim == 0 || self.topic_dim == 0 {
            return invalid("embed_dim and topic_dim must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.decoder_out_embed_dim == 0 {
            return invalid("decoder_out_embed_dim must be positive".to_string());
        }
        for (side, layers) in [("encoder", &self.encoder_layers), ("decoder", &self.decoder_layers)] {
            if layers.is_empty() {
                return invalid(format!("{} needs at least one layer", side));
            }
            for (i, spec) in layers.iter().enumerate() {
                if spec.out_channels == 0 || spec.kernel_size == 0 {
                    return invalid(format!("{} layer {} has a zero dimension: {:?}", side, i, spec));
                }
                if self.gating == Gating::Ngtu && spec.out_channels != self.embed_dim {
                    return invalid(format!(
                        "ngtu gating shares one layer norm of width {} but {} layer {} has {} channels",
                        self.embed_dim, side, i, spec.out_channels
                    ));
                }
            }
        }
        if self.decoder_attention.len() != self.decoder_layers.len() {
            return invalid(format!(
                "Attention is expected to be a list of booleans of length equal to the number of layers ({} given, {} layers)",
                self.decoder_attention.len(),
                self.decoder_layers.len()
            ));
        }
        if self.share_input_output_embed && self.decoder_out_embed_dim != self.embed_dim {
            return invalid(format!(
                "Shared embed weights implies same dimensions out_embed_dim={} vs embed_dim={}",
                self.decoder_out_embed_dim, self.embed_dim
            ));
        }
        Ok(())
    }

    /// Width of the topic-augmented embedding (`embed_dim + topic_dim`).
    pub fn augmented_dim(&self) -> usize {
        self.embed_dim + self.topic_dim
    }

    pub fn num_attention_layers(&self) -> usize {
        self.decoder_attention.iter().filter(|&&a| a).count()
    }
}
