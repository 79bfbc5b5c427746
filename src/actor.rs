// Autoregressive policy network.
//
// Embedding -> GRU cell -> two-stage projection back to vocab logits, where
// the output projection is the transposed embedding table (one shared
// parameter, gradients accumulate from both uses). Generation runs
// epsilon-greedy exploration with Gumbel-max sampling and records a per-token
// importance correction so off-policy batches stay usable by the critic.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, Embedding, Linear, Module, VarBuilder};
use rand::{rngs::StdRng, Rng};

use crate::config::Options;
use crate::net::GruCell;

/// Probabilities are clamped to this floor before the on/off-policy ratio.
const PROB_FLOOR: f32 = 1e-8;

pub struct Actor {
    embedding: Embedding,
    // Same storage as the embedding table; transposed, it is the final
    // logits projection.
    emb_weight: Tensor,
    cell: GruCell,
    dist1: Linear,
    vocab_size: usize,
    batch_size: usize,
    seq_len: usize,
}

/// One generated batch plus everything downstream losses need.
pub struct Generation {
    /// (batch, seq_len) u32 token ids in [0, vocab_size).
    pub tokens: Tensor,
    /// (batch, seq_len) f32, on-policy/off-policy probability ratio per token.
    pub corrections: Tensor,
    /// (batch, seq_len, vocab) raw (unperturbed) per-step log-probabilities.
    pub log_probs: Tensor,
    /// exp of `log_probs`.
    pub probs: Tensor,
    /// Batch-averaged raw probabilities per step, host-side: seq_len rows of
    /// vocab_size. Consumed by solved-predicates over step distributions.
    pub avg_step_probs: Vec<Vec<f32>>,
}

impl Actor {
    pub fn new(opt: &Options, vb: VarBuilder) -> Result<Self> {
        let emb_weight = vb.get_with_hints(
            (opt.vocab_size, opt.emb_size),
            "embedding",
            candle_nn::Init::Randn { mean: 0.0, stdev: 0.02 },
        )?;
        let embedding = Embedding::new(emb_weight.clone(), opt.emb_size);
        Ok(Self {
            embedding,
            emb_weight,
            cell: GruCell::new(opt.emb_size, opt.hidden_size, vb.pp("cell"))?,
            dist1: linear(opt.hidden_size, opt.emb_size, vb.pp("dist1"))?,
            vocab_size: opt.vocab_size,
            batch_size: opt.batch_size,
            seq_len: opt.seq_len,
        })
    }

    /// The embedding lookup table.
    pub fn embedding_weight(&self) -> &Tensor {
        &self.emb_weight
    }

    /// The parameter behind the vocab-logits projection. Identical storage to
    /// `embedding_weight` -- tied, not copied.
    pub fn projection_weight(&self) -> &Tensor {
        &self.emb_weight
    }

    /// Generate one batch of sequences. `epsilon` in [0, 1] is the per-step,
    /// per-element chance of sampling from a uniform distribution instead of
    /// the policy; 0.0 turns exploration off entirely.
    pub fn generate(&self, epsilon: f64, rng: &mut StdRng, device: &Device) -> Result<Generation> {
        let (b, t, v) = (self.batch_size, self.seq_len, self.vocab_size);
        let uniform_logp = -(v as f32).ln();

        let mut hidden = self.cell.zero_state(b, device)?;
        let start = Tensor::zeros(b, DType::U32, device)?;
        let mut input = self.embedding.forward(&start)?;

        let mut step_tokens: Vec<Tensor> = Vec::with_capacity(t);
        let mut step_logp: Vec<Tensor> = Vec::with_capacity(t);
        let mut corrections = vec![0.0f32; b * t];
        let mut avg_step_probs: Vec<Vec<f32>> = Vec::with_capacity(t);

        for step in 0..t {
            hidden = self.cell.step(&input, &hidden)?;
            let proj = self.dist1.forward(&hidden)?;
            let logits = proj.matmul(&self.emb_weight.t()?)?;
            let logp = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

            // Sampling and corrections run on host copies; only `logp` stays
            // in the graph.
            let logp_host = logp.to_vec2::<f32>()?;

            let mut avg = vec![0.0f32; v];
            for row in &logp_host {
                for (tok, &lp) in row.iter().enumerate() {
                    avg[tok] += lp.exp() / b as f32;
                }
            }
            avg_step_probs.push(avg);

            let mut sampled = Vec::with_capacity(b);
            for i in 0..b {
                let explored = epsilon > 0.0 && rng.gen::<f64>() < epsilon;
                let mut best = 0usize;
                let mut best_val = f32::NEG_INFINITY;
                for tok in 0..v {
                    let lp = if explored { uniform_logp } else { logp_host[i][tok] };
                    let u: f64 = rng.gen::<f64>().max(1e-12);
                    let gumbel = -(-u.ln()).ln();
                    let val = lp + gumbel as f32;
                    if val > best_val {
                        best_val = val;
                        best = tok;
                    }
                }
                let p_on = logp_host[i][best].exp().max(PROB_FLOOR);
                let p_off = if explored {
                    (1.0 / v as f32).max(PROB_FLOOR)
                } else {
                    p_on
                };
                corrections[i * t + step] = p_on / p_off;
                sampled.push(best as u32);
            }

            let sampled = Tensor::from_vec(sampled, b, device)?;
            step_tokens.push(sampled.clone());
            step_logp.push(logp);
            if step + 1 < t {
                input = self.embedding.forward(&sampled)?;
            }
        }

        let tokens = Tensor::stack(&step_tokens, 1)?;
        let log_probs = Tensor::stack(&step_logp, 1)?;
        let probs = log_probs.exp()?;
        let corrections = Tensor::from_vec(corrections, (b, t), device)?;

        Ok(Generation {
            tokens,
            corrections,
            log_probs,
            probs,
            avg_step_probs,
        })
    }
}
