//! Named architecture presets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::FConvArgs;
use crate::error::FConvError;

/// Registered architectures. `Base` fills only unset fields; every other
/// preset applies `Base` and then overrides its own fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "fconv")]
    Base,
    #[serde(rename = "fconv_newsroom")]
    Newsroom,
    #[serde(rename = "fconv_iwslt_de_en")]
    IwsltDeEn,
    #[serde(rename = "fconv_wmt_en_ro")]
    WmtEnRo,
    #[serde(rename = "fconv_wmt_en_de")]
    WmtEnDe,
    #[serde(rename = "fconv_wmt_en_fr")]
    WmtEnFr,
}

impl Architecture {
    pub const ALL: [Architecture; 6] = [
        Architecture::Base,
        Architecture::Newsroom,
        Architecture::IwsltDeEn,
        Architecture::WmtEnRo,
        Architecture::WmtEnDe,
        Architecture::WmtEnFr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Base => "fconv",
            Architecture::Newsroom => "fconv_newsroom",
            Architecture::IwsltDeEn => "fconv_iwslt_de_en",
            Architecture::WmtEnRo => "fconv_wmt_en_ro",
            Architecture::WmtEnDe => "fconv_wmt_en_de",
            Architecture::WmtEnFr => "fconv_wmt_en_fr",
        }
    }

    /// Fills `args` with this preset's values.
    pub fn apply(&self, args: &mut FConvArgs) {
        base(args);
        match self {
            Architecture::Base => {}
            Architecture::Newsroom => set(args, 256, "[(256, 3)] * 20", "[(256, 3)] * 20", 256),
            Architecture::IwsltDeEn => set(args, 256, "[(256, 3)] * 4", "[(256, 3)] * 3", 256),
            Architecture::WmtEnRo => set(args, 512, "[(512, 3)] * 20", "[(512, 3)] * 20", 512),
            Architecture::WmtEnDe => {
                let convs = "[(512, 3)] * 9 + [(1024, 3)] * 4 + [(2048, 1)] * 2";
                set(args, 768, convs, convs, 512)
            }
            Architecture::WmtEnFr => {
                let convs = "[(512, 3)] * 6 + [(768, 3)] * 4 + [(1024, 3)] * 3 \
                             + [(2048, 1)] * 1 + [(4096, 1)] * 1";
                set(args, 768, convs, convs, 512)
            }
        }
    }
}

fn base(args: &mut FConvArgs) {
    args.encoder_embed_dim.get_or_insert(512);
    args.encoder_layers.get_or_insert_with(|| "[(512, 3)] * 20".to_string());
    args.decoder_embed_dim.get_or_insert(512);
    args.decoder_layers.get_or_insert_with(|| "[(512, 3)] * 20".to_string());
    args.decoder_out_embed_dim.get_or_insert(256);
    args.decoder_attention.get_or_insert_with(|| "True".to_string());
    args.share_input_output_embed.get_or_insert(false);
}

fn set(args: &mut FConvArgs, embed_dim: usize, encoder: &str, decoder: &str, out_embed_dim: usize) {
    args.encoder_embed_dim = Some(embed_dim);
    args.encoder_layers = Some(encoder.to_string());
    args.decoder_embed_dim = Some(embed_dim);
    args.decoder_layers = Some(decoder.to_string());
    args.decoder_out_embed_dim = Some(out_embed_dim);
}

impl FromStr for Architecture {
    type Err = FConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| FConvError::InvalidConfig(format!("unknown architecture '{}'", s)))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
