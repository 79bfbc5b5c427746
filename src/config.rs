// Hyperparameters for the adversarial sequence-generation loop.
//
// One flat Options struct shared by actor, critic, replay and the trainer,
// with tier constructors (test-sized CPU config vs. full config) and a
// startup validation pass. Configuration errors are fatal before training.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which replay sampling strategy the trainer uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayKind {
    /// Uniform sampling over the whole buffer.
    Uniform,
    /// Recency-weighted sampling (newest entries more likely).
    Recent,
}

impl ReplayKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uniform" => Some(Self::Uniform),
            "recent" | "exp" => Some(Self::Recent),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    // --- Task / data ---
    pub task: String,
    pub vocab_size: usize,
    pub batch_size: usize,
    pub seq_len: usize,

    // --- Network sizes ---
    pub emb_size: usize,
    pub hidden_size: usize,
    pub critic_layers: usize,
    pub critic_dropout: f64,

    // --- Exploration / correction ---
    /// Epsilon-greedy rate during critic-phase generation. Not decayed.
    pub eps: f64,

    // --- Optimization ---
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub max_grad_norm: f64,
    /// Clamp critic parameters to [-clamp_limit, clamp_limit] before each
    /// critic step. 0.0 disables.
    pub clamp_limit: f64,

    // --- Loss shaping ---
    /// Weight on the real-data cost term in the critic loss.
    pub real_multiplier: f64,
    /// Coefficient on the critic's per-step cost-distribution entropy term.
    /// 0.0 disables.
    pub critic_entropy_reg: f64,
    /// Coefficient on the cost-magnitude regularizer. 0.0 disables.
    pub cost_penalty: f64,
    /// Actor entropy bonus coefficient.
    pub entropy_bonus: f64,
    /// Subtract the expected-cost baseline in the actor loss.
    pub use_advantage: bool,
    /// Huber-style smoothing threshold for critic costs. ~0 disables.
    pub smooth_zero: f64,
    /// Initial discount on per-step critic costs; annealed up to 1.0.
    pub gamma: f64,
    pub gamma_inc: f64,

    // --- Phase schedule ---
    pub niter: usize,
    pub critic_iters: usize,
    pub actor_iters: usize,
    /// Number of initial outer iterations that use the burn-in phase counts.
    pub burnin_iters: usize,
    pub burnin_critic_iters: usize,
    pub burnin_actor_iters: usize,

    // --- Replay ---
    pub replay: ReplayKind,
    /// Buffer capacity in sequences (not batches).
    pub replay_size: usize,
    /// Recency half-life for ReplayKind::Recent, in sequences.
    pub replay_half_life: usize,

    // --- Solved tracking ---
    pub solved_threshold: usize,
    pub solved_max_fail: usize,

    // --- Reporting ---
    pub log_every: usize,
    pub plot_every: usize,
    pub display_every: usize,
    pub out_dir: String,
    pub seed: u64,
}

impl Options {
    /// Tiny CPU config for tests: vocab 10, batch 4, seq 5.
    pub fn test() -> Self {
        Self {
            task: "words".into(),
            vocab_size: 10,
            batch_size: 4,
            seq_len: 5,
            emb_size: 8,
            hidden_size: 16,
            critic_layers: 1,
            critic_dropout: 0.0,
            eps: 0.25,
            actor_lr: 1e-3,
            critic_lr: 1e-3,
            max_grad_norm: 1.0,
            clamp_limit: 0.0,
            real_multiplier: 1.0,
            critic_entropy_reg: 0.0,
            cost_penalty: 0.0,
            entropy_bonus: 1e-3,
            use_advantage: true,
            smooth_zero: 0.01,
            gamma: 0.9,
            gamma_inc: 0.01,
            niter: 4,
            critic_iters: 2,
            actor_iters: 1,
            burnin_iters: 1,
            burnin_critic_iters: 3,
            burnin_actor_iters: 2,
            replay: ReplayKind::Uniform,
            replay_size: 64,
            replay_half_life: 16,
            solved_threshold: 3,
            solved_max_fail: 1,
            log_every: 1,
            plot_every: 2,
            display_every: 2,
            out_dir: "seqgan_out".into(),
            seed: 42,
        }
    }

    /// Full config for the toy tasks.
    pub fn default_opts() -> Self {
        Self {
            task: "words".into(),
            vocab_size: 10,
            batch_size: 32,
            seq_len: 25,
            emb_size: 32,
            hidden_size: 256,
            critic_layers: 2,
            critic_dropout: 0.1,
            eps: 0.25,
            actor_lr: 1e-4,
            critic_lr: 1e-4,
            max_grad_norm: 5.0,
            clamp_limit: 0.0,
            real_multiplier: 1.0,
            critic_entropy_reg: 0.0,
            cost_penalty: 0.0,
            entropy_bonus: 1e-3,
            use_advantage: true,
            smooth_zero: 0.01,
            gamma: 0.9,
            gamma_inc: 1e-3,
            niter: 100_000,
            critic_iters: 5,
            actor_iters: 1,
            burnin_iters: 25,
            burnin_critic_iters: 100,
            burnin_actor_iters: 10,
            replay: ReplayKind::Recent,
            replay_size: 10_000,
            replay_half_life: 1_000,
            solved_threshold: 10,
            solved_max_fail: 3,
            log_every: 10,
            plot_every: 100,
            display_every: 50,
            out_dir: "seqgan_out".into(),
            seed: 1234,
        }
    }

    /// Fatal-at-startup checks. Numeric degeneracy elsewhere is clamped, but a
    /// misconfigured run must abort before any training happens.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.vocab_size >= 3, "vocab_size must be >= 3 (0 reserved, 1 separator)");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be > 0");
        anyhow::ensure!(self.seq_len > 0, "seq_len must be > 0");
        anyhow::ensure!(self.critic_layers > 0, "critic_layers must be > 0");
        anyhow::ensure!(
            self.replay_size >= self.batch_size,
            "replay_size ({}) must be >= batch_size ({})",
            self.replay_size,
            self.batch_size
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.eps),
            "eps must be in [0, 1], got {}",
            self.eps
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.gamma),
            "gamma must be in [0, 1], got {}",
            self.gamma
        );
        anyhow::ensure!(self.solved_threshold > 0, "solved_threshold must be > 0");
        anyhow::ensure!(self.solved_max_fail > 0, "solved_max_fail must be > 0");
        Ok(())
    }
}
