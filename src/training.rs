// Adversarial training loop: alternating critic and actor phases over a
// replay buffer, with burn-in scheduling, solved-streak tracking and
// periodic logging/plotting.
//
// The critic and actor live in separate VarMaps so each optimizer can only
// ever touch its own parameters; everything crossing the phase boundary is
// detached.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{Device, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::actor::{Actor, Generation};
use crate::config::Options;
use crate::critic::Critic;
use crate::metrics::{History, MetricsLog};
use crate::net::{clip_grad_norm, gather_token_values, mean_entropy, save_checkpoint};
use crate::replay::{build_replay, Replay};
use crate::task::{build_task, Evidence, EvidenceKind, Task};

pub fn device() -> Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}

// ---------------------------------------------------------------------------
// Solved tracking
// ---------------------------------------------------------------------------

/// Streak counter over the task's solved-predicate. A run finishes early once
/// `threshold` consecutive successes accumulate; a fail during a streak is
/// tolerated up to `max_fail` times before the streak resets.
pub struct SolvedTracker {
    streak: usize,
    fails: usize,
    threshold: usize,
    max_fail: usize,
}

impl SolvedTracker {
    pub fn new(threshold: usize, max_fail: usize) -> Self {
        Self {
            streak: 0,
            fails: 0,
            threshold,
            max_fail,
        }
    }

    /// Record one solved-check outcome; returns true once the run is done.
    /// Failing with no streak in progress is a no-op.
    pub fn update(&mut self, success: bool) -> bool {
        if success {
            self.streak += 1;
            self.fails = 0;
        } else if self.streak > 0 {
            self.fails += 1;
            if self.fails >= self.max_fail {
                self.streak = 0;
                self.fails = 0;
            }
        }
        self.streak >= self.threshold
    }

    pub fn streak(&self) -> usize {
        self.streak
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct RunSummary {
    /// Outer iterations actually executed.
    pub iterations: usize,
    /// Whether the solved-streak condition ended the run.
    pub solved: bool,
}

pub struct Trainer {
    opt: Options,
    task: Box<dyn Task>,
    actor: Actor,
    actor_varmap: VarMap,
    actor_opt: AdamW,
    critic: Critic,
    critic_varmap: VarMap,
    critic_opt: AdamW,
    replay: Box<dyn Replay>,
    tracker: SolvedTracker,
    rng: StdRng,
    device: Device,
    metrics: MetricsLog,
    history: History,
    out_dir: PathBuf,
}

impl Trainer {
    pub fn new(opt: Options, device: Device) -> Result<Self> {
        let task = build_task(&opt)?;
        Self::with_task(opt, task, device)
    }

    /// Construction with an explicit task, bypassing name lookup.
    pub fn with_task(opt: Options, task: Box<dyn Task>, device: Device) -> Result<Self> {
        opt.validate()?;

        let out_dir = PathBuf::from(&opt.out_dir);
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("creating output dir {}", out_dir.display()))?;
        std::fs::write(
            out_dir.join("options.json"),
            serde_json::to_string_pretty(&opt)?,
        )?;

        let actor_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&actor_varmap, candle_core::DType::F32, &device);
        let actor = Actor::new(&opt, vb)?;
        let actor_opt = AdamW::new(
            actor_varmap.all_vars(),
            ParamsAdamW {
                lr: opt.actor_lr,
                ..Default::default()
            },
        )?;

        let critic_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&critic_varmap, candle_core::DType::F32, &device);
        let critic = Critic::new(&opt, vb)?;
        let critic_opt = AdamW::new(
            critic_varmap.all_vars(),
            ParamsAdamW {
                lr: opt.critic_lr,
                ..Default::default()
            },
        )?;

        let replay = build_replay(opt.replay, opt.replay_size, opt.replay_half_life);
        let tracker = SolvedTracker::new(opt.solved_threshold, opt.solved_max_fail);
        let rng = StdRng::seed_from_u64(opt.seed);
        let metrics = MetricsLog::create(&out_dir)?;

        Ok(Self {
            opt,
            task,
            actor,
            actor_varmap,
            actor_opt,
            critic,
            critic_varmap,
            critic_opt,
            replay,
            tracker,
            rng,
            device,
            metrics,
            history: History::new(),
            out_dir,
        })
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let niter = self.opt.niter;
        let mut solved = false;
        let mut iterations = 0;

        for iter in 0..niter {
            iterations = iter + 1;
            let burnin = iter < self.opt.burnin_iters;
            let critic_iters = if burnin {
                self.opt.burnin_critic_iters
            } else {
                self.opt.critic_iters
            };
            let actor_iters = if burnin {
                self.opt.burnin_actor_iters
            } else {
                self.opt.actor_iters
            };

            // --- Critic phase ---
            let mut wdist_sum = 0.0f32;
            let mut err_r_sum = 0.0f32;
            let mut err_f_sum = 0.0f32;
            let mut critic_grad = 0.0f64;
            for _ in 0..critic_iters.max(1) {
                let (wdist, err_r, err_f, grad) = self.critic_step()?;
                wdist_sum += wdist;
                err_r_sum += err_r;
                err_f_sum += err_f;
                critic_grad = grad;
            }
            let steps = critic_iters.max(1) as f32;
            let wdist = wdist_sum / steps;
            let err_r = err_r_sum / steps;
            let err_f = err_f_sum / steps;

            // --- Actor phase ---
            let mut actor_grad = 0.0f64;
            let mut last_gen = None;
            for _ in 0..actor_iters {
                let (generation, grad) = self.actor_step()?;
                actor_grad = grad;
                last_gen = Some(generation);
            }
            // Solved evidence always comes from an on-policy batch.
            let generation = match last_gen {
                Some(g) => g,
                None => self.actor.generate(0.0, &mut self.rng, &self.device)?,
            };

            self.critic.anneal_gamma(self.opt.gamma_inc);

            // --- Reporting ---
            if (iter + 1) % self.opt.log_every == 0 {
                self.metrics.append(wdist, err_r, err_f)?;
                self.history.wdist.push(wdist);
                self.history.err_real.push(err_r);
                self.history.err_fake.push(err_f);
                self.history.critic_grad.push(critic_grad as f32);
                self.history.actor_grad.push(actor_grad as f32);
                eprintln!(
                    "[TRAIN] iter {:>6}: Wdist {wdist:+.4} err_R {err_r:+.4} err_F {err_f:+.4} \
                     gamma {:.3} streak {}",
                    iter + 1,
                    self.critic.gamma(),
                    self.tracker.streak()
                );
            }
            if (iter + 1) % self.opt.display_every == 0 {
                self.display_batch(&generation)?;
            }
            if (iter + 1) % self.opt.plot_every == 0 {
                self.history.render(&self.out_dir)?;
            }

            // --- Solved check ---
            let success = match self.task.evidence() {
                EvidenceKind::Sequences => {
                    let rows = generation.tokens.to_vec2::<u32>()?;
                    self.task.solved(&Evidence::Sequences(&rows))
                }
                EvidenceKind::StepProbs => self
                    .task
                    .solved(&Evidence::StepProbs(&generation.avg_step_probs)),
                EvidenceKind::None => false,
            };
            if self.tracker.update(success) {
                eprintln!("[TRAIN] solved after {} iterations", iter + 1);
                solved = true;
                break;
            }
        }

        self.finish()?;
        Ok(RunSummary { iterations, solved })
    }

    /// One critic update. Returns (Wdist, err_real, err_fake, pre-clip grad
    /// norm), where Wdist = err_fake - err_real.
    fn critic_step(&mut self) -> Result<(f32, f32, f32, f64)> {
        let opt = &self.opt;

        // Fresh exploratory batch into the replay, then train on a draw that
        // mixes it with older generations.
        let generation = self.actor.generate(opt.eps, &mut self.rng, &self.device)?;
        self.replay
            .push(&generation.tokens, &generation.corrections)?;
        let (fake_tokens, corrections) =
            self.replay
                .sample(opt.batch_size, &mut self.rng, &self.device)?;

        let real_tokens = self
            .task
            .get_data(opt.batch_size, &mut self.rng, &self.device)?;

        let fake_costs = self.critic.score(&fake_tokens, true)?;
        let real_costs = self.critic.score(&real_tokens, true)?;

        // Replayed batches are off-policy; the stored per-token ratios make
        // the generated expectation unbiased again.
        let err_fake = (gather_token_values(&fake_costs, &fake_tokens)? * &corrections)?
            .mean_all()?;
        let err_real = gather_token_values(&real_costs, &real_tokens)?.mean_all()?;

        // Push generated cost up, real cost down.
        let mut loss = (err_real.affine(opt.real_multiplier, 0.0)? - &err_fake)?;

        if opt.critic_entropy_reg > 0.0 {
            let logq = candle_nn::ops::log_softmax(&fake_costs.neg()?, D::Minus1)?;
            let q = logq.exp()?;
            let ent = mean_entropy(&q, &logq)?;
            loss = (&loss - &ent.affine(opt.critic_entropy_reg, 0.0)?)?;
        }
        if opt.cost_penalty > 0.0 {
            let magnitude = (fake_costs.sqr()?.mean_all()? + real_costs.sqr()?.mean_all()?)?;
            loss = (&loss + &magnitude.affine(opt.cost_penalty, 0.0)?)?;
        }

        let mut grads = loss.backward()?;
        let vars = self.critic_varmap.all_vars();
        let norm = clip_grad_norm(&vars, &mut grads, opt.max_grad_norm)?;
        self.critic_opt.step(&grads)?;

        if opt.clamp_limit > 0.0 {
            let limit = opt.clamp_limit;
            for var in &vars {
                let clamped = var.as_tensor().clamp(-limit, limit)?;
                var.set(&clamped)?;
            }
        }

        let err_f = err_fake.to_scalar::<f32>()?;
        let err_r = err_real.to_scalar::<f32>()?;
        Ok((err_f - err_r, err_r, err_f, norm))
    }

    /// One actor update against detached critic costs. Returns the generation
    /// (reused for display and solved evidence) and the pre-clip grad norm.
    fn actor_step(&mut self) -> Result<(Generation, f64)> {
        let opt = &self.opt;

        // Actor updates stay on-policy: no exploration noise.
        let generation = self.actor.generate(0.0, &mut self.rng, &self.device)?;

        let costs = self.critic.score(&generation.tokens, false)?.detach();
        let taken_cost = gather_token_values(&costs, &generation.tokens)?;

        let signal = if opt.use_advantage {
            // Exact expected cost under the current policy, from the dense
            // cost tensor. No gradient through the baseline.
            let baseline = (&costs * &generation.probs.detach())?.sum(D::Minus1)?;
            (&taken_cost - &baseline)?
        } else {
            taken_cost
        };

        let logp_taken = gather_token_values(&generation.log_probs, &generation.tokens)?;
        let weighted = ((&signal * &generation.corrections)? * &logp_taken)?;
        let mut loss = weighted.mean_all()?;

        if opt.entropy_bonus > 0.0 {
            let entropy = mean_entropy(&generation.probs, &generation.log_probs)?;
            loss = (&loss - &entropy.affine(opt.entropy_bonus, 0.0)?)?;
        }

        let mut grads = loss.backward()?;
        let vars = self.actor_varmap.all_vars();
        let norm = clip_grad_norm(&vars, &mut grads, opt.max_grad_norm)?;
        self.actor_opt.step(&grads)?;

        Ok((generation, norm))
    }

    /// Print the latest generated batch with one real row mixed in at a
    /// random position, as an eyeball Turing test.
    fn display_batch(&mut self, generation: &Generation) -> Result<()> {
        let mut rows = generation.tokens.to_vec2::<u32>()?;
        let real = self.task.get_data(1, &mut self.rng, &self.device)?;
        let real_row = real.to_vec2::<u32>()?.swap_remove(0);
        let slot = self.rng.gen_range(0..=rows.len());
        rows.insert(slot, real_row);
        self.task.display(&rows);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.history.render(&self.out_dir)?;
        let actor_path = self.out_dir.join("actor.safetensors");
        let critic_path = self.out_dir.join("critic.safetensors");
        save_checkpoint(&self.actor_varmap, &actor_path.to_string_lossy())?;
        save_checkpoint(&self.critic_varmap, &critic_path.to_string_lossy())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_streak_reset_and_rebuild() {
        // threshold 3, one tolerated fail resets the streak
        let mut tracker = SolvedTracker::new(3, 1);
        let mut streaks = Vec::new();
        for &ok in &[true, true, false, true, true] {
            tracker.update(ok);
            streaks.push(tracker.streak());
        }
        assert_eq!(streaks, vec![1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_tracker_fail_without_streak_is_noop() {
        let mut tracker = SolvedTracker::new(2, 1);
        assert!(!tracker.update(false));
        assert!(!tracker.update(false));
        assert_eq!(tracker.streak(), 0);
        assert!(!tracker.update(true));
        assert!(tracker.update(true));
    }

    #[test]
    fn test_tracker_tolerates_fails_below_max() {
        let mut tracker = SolvedTracker::new(3, 3);
        tracker.update(true);
        tracker.update(false);
        tracker.update(false);
        // Two fails under max_fail 3: streak survives.
        assert_eq!(tracker.streak(), 1);
        tracker.update(true);
        assert!(tracker.update(true));
    }

    #[test]
    fn test_smoke_run_writes_artifacts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut opt = Options::test();
        opt.out_dir = dir.path().to_string_lossy().into_owned();
        opt.niter = 2;
        opt.log_every = 1;
        opt.plot_every = 1;
        opt.display_every = 1;

        let mut trainer = Trainer::new(opt, Device::Cpu)?;
        let summary = trainer.run()?;
        assert_eq!(summary.iterations, 2);

        assert!(dir.path().join("options.json").exists());
        assert!(dir.path().join("train.log").exists());
        assert!(dir.path().join("training.svg").exists());
        assert!(dir.path().join("grad_norms.svg").exists());
        assert!(dir.path().join("actor.safetensors").exists());
        assert!(dir.path().join("critic.safetensors").exists());

        let log = std::fs::read_to_string(dir.path().join("train.log"))?;
        assert_eq!(log.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn test_loss_shaping_knobs_train_and_clamp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut opt = Options::test();
        opt.out_dir = dir.path().to_string_lossy().into_owned();
        opt.niter = 2;
        opt.critic_entropy_reg = 0.1;
        opt.cost_penalty = 0.01;
        opt.clamp_limit = 0.5;

        let mut trainer = Trainer::new(opt, Device::Cpu)?;
        let summary = trainer.run()?;
        assert_eq!(summary.iterations, 2);

        // Every critic parameter ends inside the clamp bound.
        for var in trainer.critic_varmap.all_vars() {
            let max = var.as_tensor().abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(max <= 0.5 + 1e-6, "critic param escaped clamp: {max}");
        }

        // Metrics stayed finite with the extra loss terms on.
        let log = std::fs::read_to_string(dir.path().join("train.log"))?;
        for line in log.lines() {
            for field in line.split('\t') {
                assert!(field.parse::<f32>()?.is_finite());
            }
        }
        Ok(())
    }

    #[test]
    fn test_invalid_options_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = Options::test();
        opt.out_dir = dir.path().to_string_lossy().into_owned();
        opt.eps = 2.0;
        assert!(Trainer::new(opt, Device::Cpu).is_err());
    }
}
