// Replay buffer decoupling critic-update batches from actor-generation
// batches. Entries are per-sequence snapshots of (tokens, importance
// corrections); the corrections travel with the sequence so off-policy
// replay stays statistically correctable.

use std::collections::VecDeque;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::ReplayKind;

struct Entry {
    tokens: Vec<u32>,
    corrections: Vec<f32>,
}

pub trait Replay {
    /// Append one batch worth of (sequence, correction) rows, evicting the
    /// oldest entries beyond capacity.
    fn push(&mut self, tokens: &Tensor, corrections: &Tensor) -> Result<()>;

    /// Draw `n` distinct entries. Calling with `n` greater than the current
    /// size is a contract violation and fails; it never returns fewer.
    fn sample(&self, n: usize, rng: &mut StdRng, device: &Device) -> Result<(Tensor, Tensor)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn build_replay(kind: ReplayKind, capacity: usize, half_life: usize) -> Box<dyn Replay> {
    match kind {
        ReplayKind::Uniform => Box::new(UniformReplay::new(capacity)),
        ReplayKind::Recent => Box::new(RecencyReplay::new(capacity, half_life)),
    }
}

// ---------------------------------------------------------------------------
// Shared ring-buffer mechanics
// ---------------------------------------------------------------------------

fn push_rows(entries: &mut VecDeque<Entry>, capacity: usize, tokens: &Tensor, corrections: &Tensor) -> Result<()> {
    let token_rows = tokens.to_vec2::<u32>()?;
    let corr_rows = corrections.to_vec2::<f32>()?;
    anyhow::ensure!(
        token_rows.len() == corr_rows.len(),
        "token/correction batch mismatch: {} vs {}",
        token_rows.len(),
        corr_rows.len()
    );
    for (tokens, corrections) in token_rows.into_iter().zip(corr_rows) {
        if entries.len() >= capacity {
            entries.pop_front(); // FIFO eviction
        }
        entries.push_back(Entry { tokens, corrections });
    }
    Ok(())
}

fn collect(entries: &VecDeque<Entry>, picked: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
    let n = picked.len();
    let t = entries[picked[0]].tokens.len();
    let mut tokens = Vec::with_capacity(n * t);
    let mut corrections = Vec::with_capacity(n * t);
    for &i in picked {
        tokens.extend_from_slice(&entries[i].tokens);
        corrections.extend_from_slice(&entries[i].corrections);
    }
    Ok((
        Tensor::from_vec(tokens, (n, t), device)?,
        Tensor::from_vec(corrections, (n, t), device)?,
    ))
}

// ---------------------------------------------------------------------------
// Uniform replay
// ---------------------------------------------------------------------------

pub struct UniformReplay {
    entries: VecDeque<Entry>,
    capacity: usize,
}

impl UniformReplay {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

impl Replay for UniformReplay {
    fn push(&mut self, tokens: &Tensor, corrections: &Tensor) -> Result<()> {
        push_rows(&mut self.entries, self.capacity, tokens, corrections)
    }

    fn sample(&self, n: usize, rng: &mut StdRng, device: &Device) -> Result<(Tensor, Tensor)> {
        anyhow::ensure!(
            n <= self.entries.len(),
            "sample({n}) from replay holding {} entries",
            self.entries.len()
        );
        let picked: Vec<usize> = rand::seq::index::sample(rng, self.entries.len(), n).into_vec();
        collect(&self.entries, &picked, device)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Recency-weighted replay
// ---------------------------------------------------------------------------

/// Sampling weight halves every `half_life` entries of age, so the newest
/// `half_life` entries carry roughly the same cumulative weight as the whole
/// remainder, and a newer entry is always at least as likely as an older one.
pub struct RecencyReplay {
    entries: VecDeque<Entry>,
    capacity: usize,
    half_life: usize,
}

impl RecencyReplay {
    pub fn new(capacity: usize, half_life: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            half_life: half_life.max(1),
        }
    }
}

impl Replay for RecencyReplay {
    fn push(&mut self, tokens: &Tensor, corrections: &Tensor) -> Result<()> {
        push_rows(&mut self.entries, self.capacity, tokens, corrections)
    }

    fn sample(&self, n: usize, rng: &mut StdRng, device: &Device) -> Result<(Tensor, Tensor)> {
        let len = self.entries.len();
        anyhow::ensure!(n <= len, "sample({n}) from replay holding {len} entries");

        // Entries are stored oldest-first; weight by age rank from the newest.
        let mut weights: Vec<f64> = (0..len)
            .map(|i| 0.5f64.powf((len - 1 - i) as f64 / self.half_life as f64))
            .collect();

        let mut picked = Vec::with_capacity(n);
        for _ in 0..n {
            let total: f64 = weights.iter().sum();
            let mut r = rng.gen::<f64>() * total;
            let mut choice = None;
            for (i, &w) in weights.iter().enumerate() {
                if w <= 0.0 {
                    continue;
                }
                r -= w;
                if r <= 0.0 {
                    choice = Some(i);
                    break;
                }
            }
            // Float residue can walk past the end; fall back to the last
            // entry still carrying weight.
            let i = match choice {
                Some(i) => i,
                None => weights.iter().rposition(|&w| w > 0.0).ok_or_else(|| {
                    anyhow::anyhow!(
                        "weighted draw exhausted with {} of {n} picks remaining",
                        n - picked.len()
                    )
                })?,
            };
            weights[i] = 0.0;
            picked.push(i);
        }
        collect(&self.entries, &picked, device)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
