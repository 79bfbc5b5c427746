// Gradient-safe network building blocks on candle basic ops.
//
// The GRU cell is hand-rolled from Linear + sigmoid/tanh rather than taken
// from candle_nn::rnn: composite candle_nn ops have had unreliable backward
// passes, and everything here sits on the training path.

use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

// ---------------------------------------------------------------------------
// GRU cell
// ---------------------------------------------------------------------------

pub struct GruCell {
    w_ih: Linear,
    w_hh: Linear,
    hidden_size: usize,
}

impl GruCell {
    pub fn new(in_dim: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_ih: linear(in_dim, 3 * hidden_size, vb.pp("w_ih"))?,
            w_hh: linear(hidden_size, 3 * hidden_size, vb.pp("w_hh"))?,
            hidden_size,
        })
    }

    pub fn zero_state(&self, batch: usize, device: &Device) -> Result<Tensor> {
        Tensor::zeros((batch, self.hidden_size), DType::F32, device).map_err(Into::into)
    }

    /// One recurrent step: (input (B, in_dim), hidden (B, H)) -> new hidden.
    pub fn step(&self, input: &Tensor, hidden: &Tensor) -> Result<Tensor> {
        let gi = self.w_ih.forward(input)?;
        let gh = self.w_hh.forward(hidden)?;
        let gi = gi.chunk(3, D::Minus1)?;
        let gh = gh.chunk(3, D::Minus1)?;

        let r = candle_nn::ops::sigmoid(&(&gi[0] + &gh[0])?)?;
        let z = candle_nn::ops::sigmoid(&(&gi[1] + &gh[1])?)?;
        let n = (&gi[2] + (r * &gh[2])?)?.tanh()?;

        // h' = (1 - z) * n + z * h
        let keep = z.affine(-1.0, 1.0)?;
        ((keep * n)? + (z * hidden)?).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Dense-tensor helpers
// ---------------------------------------------------------------------------

pub fn one_hot_tensor(indices: &Tensor, num_classes: usize, device: &Device) -> Result<Tensor> {
    let n = indices.elem_count();
    let indices_vec: Vec<u32> = indices.to_vec1()?;
    let mut data = vec![0.0f32; n * num_classes];
    for (i, &idx) in indices_vec.iter().enumerate() {
        let idx = idx as usize;
        if idx < num_classes {
            data[i * num_classes + idx] = 1.0;
        }
    }
    Tensor::from_vec(data, (n, num_classes), device).map_err(Into::into)
}

/// Slice a dense (B, T, V) tensor by the token taken at each position,
/// yielding (B, T). Differentiable through `values`.
pub fn gather_token_values(values: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (b, t, v) = values.dims3()?;
    let flat = values.reshape((b * t, v))?;
    let idx = tokens.reshape(b * t)?;
    let one_hot = one_hot_tensor(&idx, v, values.device())?;
    (flat * one_hot)?.sum(1)?.reshape((b, t)).map_err(Into::into)
}

/// Mean entropy of per-step distributions: -E[sum_v p log p].
pub fn mean_entropy(probs: &Tensor, log_probs: &Tensor) -> Result<Tensor> {
    (probs * log_probs)?
        .sum(D::Minus1)?
        .neg()?
        .mean_all()
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Gradient norm + clipping
// ---------------------------------------------------------------------------

pub fn grad_global_norm(vars: &[Var], grads: &GradStore) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sum_sq.sqrt())
}

/// Scale all gradients so the global norm does not exceed `max_norm`.
/// Returns the pre-clip norm (reported on the gradient chart).
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let norm = grad_global_norm(vars, grads)?;
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = (g * scale)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

// ---------------------------------------------------------------------------
// Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(varmap: &VarMap, path: &str) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let named: std::collections::HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    eprintln!("[CHECKPOINT] Saved {} params to {path}", named.len());
    Ok(())
}

pub fn load_checkpoint(varmap: &VarMap, path: &str, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved) = tensors.get(name) {
            var.set(saved)?;
            loaded += 1;
        }
    }
    eprintln!("[CHECKPOINT] Loaded {loaded}/{} params from {path}", data.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
