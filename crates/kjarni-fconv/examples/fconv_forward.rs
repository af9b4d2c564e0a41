use anyhow::Result;
use kjarni_fconv::prelude::*;
use kjarni_fconv::{FConvArgs, Gating};
use ndarray::{Array2, Array3, Axis, concatenate, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;
use rand::SeedableRng;
use rand::rngs::StdRng;

const EMBED_DIM: usize = 32;
const TOPIC_DIM: usize = 16;
const SRC_VOCAB: usize = 50;
const TGT_VOCAB: usize = 40;
const BOS: u32 = 2;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = FConvArgs {
        arch: Some(Architecture::Base),
        encoder_layers: Some(format!("[({}, 3)] * 4", EMBED_DIM)),
        decoder_layers: Some(format!("[({}, 3)] * 3", EMBED_DIM)),
        decoder_out_embed_dim: Some(24),
        topic_dim: TOPIC_DIM,
        gating: Gating::Ngtu,
        ..Default::default()
    };
    let config = FConvConfig::from_args(&args, EMBED_DIM)?;

    let mut rng = StdRng::seed_from_u64(42);
    let pretrained = Array2::random_using((SRC_VOCAB, EMBED_DIM), Uniform::new(-0.5f32, 0.5), &mut rng);
    let model = FConvModel::build(config, SRC_VOCAB, TGT_VOCAB, &pretrained.view(), &mut rng)?;

    let (batch, src_len, tgt_len) = (2, 9, 6);
    let input = Seq2SeqBatch {
        src_tokens: Array2::random_using((batch, src_len), Uniform::new(3u32, SRC_VOCAB as u32), &mut rng),
        src_lengths: vec![src_len; batch],
        src_doctopic: Array2::random_using((batch, TOPIC_DIM), Uniform::new(0.0f32, 1.0), &mut rng),
        src_wordtopics: Array3::random_using((batch, src_len, TOPIC_DIM), Uniform::new(0.0f32, 1.0), &mut rng),
        prev_output_tokens: Array2::random_using((batch, tgt_len), Uniform::new(3u32, TGT_VOCAB as u32), &mut rng),
    };

    // --- 1. FULL FORWARD ---
    let out = model.forward(&input)?;
    log::info!("logits shape: {:?}", out.logits.shape());
    if let Some(attn) = &out.attn {
        log::info!("attention shape: {:?}", attn.shape());
    }

    // --- 2. GREEDY INCREMENTAL DECODE ---
    let encoder_out = model.encode(
        &input.src_tokens.view(),
        &input.src_lengths,
        &input.src_doctopic.view(),
        &input.src_wordtopics.view(),
    )?;
    let mut state = model.new_incremental_state();
    let mut tokens = Array2::from_elem((batch, 1), BOS);
    for _ in 0..tgt_len {
        let step = model.decode_step(&tokens.view(), &encoder_out, &input.src_doctopic.view(), &mut state)?;
        let probs = model.normalized_probs(&step.logits, true);
        let next: Vec<u32> = probs
            .slice(s![.., 0, ..])
            .outer_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
                    .0 as u32
            })
            .collect();
        let next = Array2::from_shape_vec((batch, 1), next)?;
        tokens = concatenate(Axis(1), &[tokens.view(), next.view()])?;
    }
    log::info!("decoded {} steps", state.get_seq_length());
    for (i, row) in tokens.outer_iter().enumerate() {
        log::info!("  hypothesis {}: {:?}", i, row.to_vec());
    }

    Ok(())
}
