// Cost network: scores a token sequence with a dense per-timestep,
// per-vocabulary cost tensor.
//
// Dense costs (rather than one scalar per sequence) let the actor phase form
// an exact expected-cost baseline over its own distribution without a second
// critic call. A start token is prepended so position i is scored from the
// prefix ending at i-1; the final timestep (which only sees the shifted
// padding) is dropped to realign with seq_len.

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{linear, Embedding, Linear, Module, VarBuilder};

use crate::config::Options;
use crate::net::GruCell;

/// Below this threshold the Huber-style smoothing is treated as disabled.
const SMOOTH_EPS: f64 = 1e-12;

pub struct Critic {
    embedding: Embedding,
    layers: Vec<GruCell>,
    cost: Linear,
    dropout: f64,
    smooth_zero: f64,
    gamma: f64,
}

impl Critic {
    pub fn new(opt: &Options, vb: VarBuilder) -> Result<Self> {
        let emb_weight = vb.get_with_hints(
            (opt.vocab_size, opt.emb_size),
            "embedding",
            candle_nn::Init::Randn { mean: 0.0, stdev: 0.02 },
        )?;
        let embedding = Embedding::new(emb_weight, opt.emb_size);

        let mut layers = Vec::with_capacity(opt.critic_layers);
        for i in 0..opt.critic_layers {
            let in_dim = if i == 0 { opt.emb_size } else { opt.hidden_size };
            layers.push(GruCell::new(
                in_dim,
                opt.hidden_size,
                vb.pp(format!("gru_{i}")),
            )?);
        }

        Ok(Self {
            embedding,
            layers,
            cost: linear(opt.hidden_size, opt.vocab_size, vb.pp("cost"))?,
            dropout: opt.critic_dropout,
            smooth_zero: opt.smooth_zero,
            gamma: opt.gamma,
        })
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Gamma only ever moves up, capped at 1.0.
    pub fn anneal_gamma(&mut self, inc: f64) {
        self.gamma = (self.gamma + inc).min(1.0);
    }

    /// Score a (batch, seq_len) u32 token batch. Returns dense costs of shape
    /// (batch, seq_len, vocab). `train` enables inter-layer dropout.
    pub fn score(&self, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t) = tokens.dims2()?;
        let device = tokens.device();

        let start = Tensor::zeros((b, 1), DType::U32, device)?;
        let padded = Tensor::cat(&[&start, tokens], 1)?;
        let embs = self.embedding.forward(&padded)?;

        let mut states: Vec<Tensor> = self
            .layers
            .iter()
            .map(|l| l.zero_state(b, device))
            .collect::<Result<_>>()?;

        let mut outputs = Vec::with_capacity(t + 1);
        for step in 0..=t {
            let mut x = embs.narrow(1, step, 1)?.squeeze(1)?;
            for (li, layer) in self.layers.iter().enumerate() {
                states[li] = layer.step(&x, &states[li])?;
                x = states[li].clone();
                if train && self.dropout > 0.0 && li + 1 < self.layers.len() {
                    x = candle_nn::ops::dropout(&x, self.dropout as f32)?;
                }
            }
            outputs.push(x);
        }

        let hidden = Tensor::stack(&outputs, 1)?;
        let hidden = hidden.narrow(1, 0, t)?;
        let mut costs = self.cost.forward(&hidden)?;

        if self.smooth_zero > SMOOTH_EPS {
            costs = smooth_costs(&costs, self.smooth_zero)?;
        }
        if self.gamma < 1.0 {
            let discount: Vec<f32> = (0..t).map(|i| self.gamma.powi(i as i32) as f32).collect();
            let discount = Tensor::from_vec(discount, (1, t, 1), device)?;
            costs = costs.broadcast_mul(&discount)?;
        }
        Ok(costs)
    }
}

/// Huber-style transform: quadratic inside [-zero, zero], shifted absolute
/// value outside. Value and first derivative agree at the boundary.
pub fn smooth_costs(costs: &Tensor, zero: f64) -> Result<Tensor> {
    let abs = costs.abs()?;
    let quad = (costs.sqr()? / (2.0 * zero))?;
    let lin = abs.affine(1.0, -(zero / 2.0))?;
    let thresh = Tensor::full(zero as f32, abs.dims(), abs.device())?;
    let mask = abs.lt(&thresh)?;
    mask.where_cond(&quad, &lin).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::gather_token_values;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn test_critic(opt: &Options) -> (Critic, Device) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        (Critic::new(opt, vb).unwrap(), device)
    }

    #[test]
    fn test_cost_tensor_shapes() -> Result<()> {
        let opt = Options::test();
        let (critic, device) = test_critic(&opt);

        let tokens = Tensor::zeros((4, 5), DType::U32, &device)?;
        let costs = critic.score(&tokens, false)?;
        assert_eq!(costs.dims3()?, (4, 5, 10));

        let taken = gather_token_values(&costs, &tokens)?;
        assert_eq!(taken.dims2()?, (4, 5));
        Ok(())
    }

    #[test]
    fn test_multi_layer_shapes() -> Result<()> {
        let mut opt = Options::test();
        opt.critic_layers = 3;
        opt.critic_dropout = 0.2;
        let (critic, device) = test_critic(&opt);

        let tokens = Tensor::ones((2, 5), DType::U32, &device)?;
        let costs = critic.score(&tokens, true)?;
        assert_eq!(costs.dims3()?, (2, 5, 10));
        Ok(())
    }

    #[test]
    fn test_discounting_scales_steps() -> Result<()> {
        let mut opt = Options::test();
        opt.gamma = 1.0;
        opt.smooth_zero = 0.0;
        let (mut critic, device) = test_critic(&opt);

        let tokens = Tensor::ones((2, 5), DType::U32, &device)?;
        let base = critic.score(&tokens, false)?;

        critic.gamma = 0.5;
        let discounted = critic.score(&tokens, false)?;

        let base = base.to_vec3::<f32>()?;
        let discounted = discounted.to_vec3::<f32>()?;
        for bi in 0..2 {
            for step in 0..5 {
                let scale = 0.5f32.powi(step as i32);
                for v in 0..10 {
                    let expect = base[bi][step][v] * scale;
                    let got = discounted[bi][step][v];
                    assert!(
                        (expect - got).abs() < 1e-5,
                        "step {step}: {got} vs {expect}"
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_anneal_gamma_monotone_capped() {
        let mut opt = Options::test();
        opt.gamma = 0.95;
        let (mut critic, _device) = test_critic(&opt);
        let mut prev = critic.gamma();
        for _ in 0..20 {
            critic.anneal_gamma(0.01);
            assert!(critic.gamma() >= prev);
            assert!(critic.gamma() <= 1.0);
            prev = critic.gamma();
        }
        assert!((critic.gamma() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_smoothing_continuous_at_boundary() -> Result<()> {
        let device = Device::Cpu;
        let zero = 0.1f64;
        let h = 1e-4f32;
        let z = zero as f32;

        let xs = Tensor::new(vec![z - 2.0 * h, z - h, z, z + h, z + 2.0 * h], &device)?;
        let ys = smooth_costs(&xs, zero)?.to_vec1::<f32>()?;

        // Value continuity across the boundary.
        assert!(
            (ys[1] - ys[3]).abs() < 3.0 * h,
            "value jump at boundary: {} vs {}",
            ys[1],
            ys[3]
        );
        // One-sided difference quotients match (both ~1 at the boundary).
        let left = (ys[2] - ys[0]) / (2.0 * h);
        let right = (ys[4] - ys[2]) / (2.0 * h);
        assert!(
            (left - right).abs() < 1e-2,
            "derivative mismatch at boundary: {left} vs {right}"
        );
        Ok(())
    }

    #[test]
    fn test_smoothing_branches() -> Result<()> {
        let device = Device::Cpu;
        let zero = 0.5f64;
        let xs = Tensor::new(vec![0.0f32, 0.1, -0.1, 2.0, -2.0], &device)?;
        let ys = smooth_costs(&xs, zero)?.to_vec1::<f32>()?;

        assert!(ys[0].abs() < 1e-7);
        assert!((ys[1] - 0.1f32.powi(2) / 1.0).abs() < 1e-6); // x^2 / (2 * 0.5)
        assert!((ys[1] - ys[2]).abs() < 1e-7, "smoothing must be even");
        assert!((ys[3] - (2.0 - 0.25)).abs() < 1e-6); // |x| - zero/2
        assert!((ys[3] - ys[4]).abs() < 1e-7);
        Ok(())
    }
}
