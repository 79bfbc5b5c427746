// Pluggable tasks: real-data batches, a display routine and a
// solved-predicate. Token 0 is reserved as the start/pad symbol and never
// appears in real data; token 1 is the separator/marker symbol.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::Options;

/// Which evidence the training loop should hand to `solved`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvidenceKind {
    /// Generated token rows from the latest actor batch.
    Sequences,
    /// Batch-averaged per-step probabilities (seq_len rows of vocab_size).
    StepProbs,
    /// Task has no completion predicate; the loop runs to its iteration budget.
    None,
}

pub enum Evidence<'a> {
    Sequences(&'a [Vec<u32>]),
    StepProbs(&'a [Vec<f32>]),
    None,
}

pub trait Task {
    /// A real-data batch of shape (batch_size, seq_len), tokens in
    /// [1, vocab_size).
    fn get_data(&self, batch_size: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor>;

    /// Human-readable rendering of a token batch.
    fn display(&self, rows: &[Vec<u32>]);

    fn evidence(&self) -> EvidenceKind;

    fn solved(&self, evidence: &Evidence) -> bool;
}

/// Unknown task names are a fatal configuration error.
pub fn build_task(opt: &Options) -> Result<Box<dyn Task>> {
    match opt.task.as_str() {
        "words" => Ok(Box::new(WordsTask::new(opt.vocab_size, opt.seq_len))),
        "longterm" => Ok(Box::new(LongtermTask::new(opt.vocab_size, opt.seq_len))),
        other => anyhow::bail!("unknown task '{other}' (expected 'words' or 'longterm')"),
    }
}

// ---------------------------------------------------------------------------
// Words task
// ---------------------------------------------------------------------------

/// Toy sequences where a "word" is consecutive increasing integers and token 1
/// separates words. A word continues with probability 0.75 and is forced to
/// end when its next character would leave the vocabulary.
pub struct WordsTask {
    vocab_size: usize,
    seq_len: usize,
    /// Fraction of generated rows that must parse as valid word sequences.
    solved_frac: f64,
}

impl WordsTask {
    pub fn new(vocab_size: usize, seq_len: usize) -> Self {
        Self {
            vocab_size,
            seq_len,
            solved_frac: 0.9,
        }
    }

    /// Check one row against the generator's grammar.
    pub fn valid_row(&self, row: &[u32]) -> bool {
        let top = (self.vocab_size - 2) as i64; // largest word value
        let mut cur = match row.first() {
            Some(&t) => t as i64 - 1,
            None => return false,
        };
        if cur < 1 || cur > top {
            return false; // rows always open with a word character
        }
        for &tok in &row[1..] {
            let t = tok as i64;
            if cur == 0 {
                // After a separator a new word must start.
                if t < 2 || t > top + 1 {
                    return false;
                }
                cur = t - 1;
            } else if t == 1 {
                cur = 0;
            } else if t == cur + 2 && cur + 1 <= top {
                cur += 1;
            } else {
                return false;
            }
        }
        true
    }
}

impl Task for WordsTask {
    fn get_data(&self, batch_size: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
        // Port of the toy generator: cur_word walks upward, wraps to the
        // separator state past vocab_size - 2, and otherwise dies with
        // probability 0.25. Freshly started words skip the death roll.
        let top = self.vocab_size as u32 - 2;
        let t = self.seq_len;
        let mut rows = Vec::with_capacity(batch_size * t);

        for _ in 0..batch_size {
            let mut cur = rng.gen_range(1..=top);
            rows.push(cur + 1);
            for _ in 1..t {
                if cur == 0 {
                    cur = rng.gen_range(1..=top);
                } else {
                    cur += 1;
                    if cur > top || !rng.gen_bool(0.75) {
                        cur = 0;
                    }
                }
                rows.push(cur + 1);
            }
        }
        Tensor::from_vec(rows, (batch_size, t), device).map_err(Into::into)
    }

    fn display(&self, rows: &[Vec<u32>]) {
        for row in rows {
            let rendered: String = row.iter().map(|&t| render_token(t)).collect();
            eprintln!("[TASK] {rendered}");
        }
    }

    fn evidence(&self) -> EvidenceKind {
        EvidenceKind::Sequences
    }

    fn solved(&self, evidence: &Evidence) -> bool {
        match evidence {
            Evidence::Sequences(rows) if !rows.is_empty() => {
                let valid = rows.iter().filter(|r| self.valid_row(r)).count();
                valid as f64 >= self.solved_frac * rows.len() as f64
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Longterm task
// ---------------------------------------------------------------------------

/// Marker token 1 opens and closes every sequence; the middle is uniform
/// filler in [2, vocab_size). Reproducing the closing marker requires credit
/// to travel the full sequence length.
pub struct LongtermTask {
    vocab_size: usize,
    seq_len: usize,
    /// Probability mass required on the markers at both ends.
    solve_mass: f32,
}

impl LongtermTask {
    pub fn new(vocab_size: usize, seq_len: usize) -> Self {
        Self {
            vocab_size,
            seq_len,
            solve_mass: 0.9,
        }
    }
}

impl Task for LongtermTask {
    fn get_data(&self, batch_size: usize, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
        let (t, v) = (self.seq_len, self.vocab_size as u32);
        let mut rows = Vec::with_capacity(batch_size * t);
        for _ in 0..batch_size {
            for step in 0..t {
                if step == 0 || step == t - 1 {
                    rows.push(1u32);
                } else {
                    rows.push(rng.gen_range(2..v));
                }
            }
        }
        Tensor::from_vec(rows, (batch_size, t), device).map_err(Into::into)
    }

    fn display(&self, rows: &[Vec<u32>]) {
        for row in rows {
            let rendered: String = row.iter().map(|&t| render_token(t)).collect();
            eprintln!("[TASK] {rendered}");
        }
    }

    fn evidence(&self) -> EvidenceKind {
        EvidenceKind::StepProbs
    }

    fn solved(&self, evidence: &Evidence) -> bool {
        let probs = match evidence {
            Evidence::StepProbs(p) if p.len() == self.seq_len => p,
            _ => return false,
        };
        let spill = 1.0 - self.solve_mass;
        for (step, dist) in probs.iter().enumerate() {
            let marker = dist.get(1).copied().unwrap_or(0.0);
            let pad = dist.first().copied().unwrap_or(0.0);
            if step == 0 || step == self.seq_len - 1 {
                if marker < self.solve_mass {
                    return false;
                }
            } else if marker > spill || pad > spill {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_token(t: u32) -> char {
    match t {
        0 => '_',
        1 => '|',
        t => char::from_u32('a' as u32 + t - 2).unwrap_or('?'),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_unknown_task_is_fatal() {
        let mut opt = Options::test();
        opt.task = "nope".into();
        assert!(build_task(&opt).is_err());
    }

    #[test]
    fn test_words_data_is_valid_by_construction() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(0);
        let task = WordsTask::new(10, 7);

        for _ in 0..10 {
            let batch = task.get_data(8, &mut rng, &device)?;
            let rows = batch.to_vec2::<u32>()?;
            for row in &rows {
                assert!(task.valid_row(row), "generator emitted invalid row {row:?}");
                assert!(row.iter().all(|&t| t >= 1 && t < 10));
            }
        }
        Ok(())
    }

    #[test]
    fn test_words_rejects_garbage() {
        let task = WordsTask::new(10, 7);
        assert!(!task.valid_row(&[0, 0, 0])); // reserved token
        assert!(!task.valid_row(&[1, 2, 3])); // opens with separator
        assert!(!task.valid_row(&[2, 4, 5])); // skips a character
        assert!(!task.valid_row(&[9, 9, 9])); // repeats instead of advancing
        assert!(task.valid_row(&[2, 3, 4, 1, 5, 6]));
        assert!(task.valid_row(&[5, 6, 7, 8, 9])); // runs to the top value
    }

    #[test]
    fn test_words_solved_fraction() {
        let task = WordsTask::new(10, 7);
        let good = vec![2u32, 3, 4, 1, 2];
        let bad = vec![2u32, 2, 2, 2, 2];

        let all_good: Vec<Vec<u32>> = (0..10).map(|_| good.clone()).collect();
        assert!(task.solved(&Evidence::Sequences(&all_good)));

        let mut mixed = all_good.clone();
        mixed[0] = bad.clone();
        mixed[1] = bad.clone();
        assert!(!task.solved(&Evidence::Sequences(&mixed)));

        assert!(!task.solved(&Evidence::None));
        assert!(!task.solved(&Evidence::Sequences(&[])));
    }

    #[test]
    fn test_longterm_data_shape_and_markers() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(1);
        let task = LongtermTask::new(10, 6);

        let batch = task.get_data(4, &mut rng, &device)?;
        for row in batch.to_vec2::<u32>()? {
            assert_eq!(row.len(), 6);
            assert_eq!(row[0], 1);
            assert_eq!(row[5], 1);
            assert!(row[1..5].iter().all(|&t| (2..10).contains(&t)));
        }
        Ok(())
    }

    #[test]
    fn test_longterm_solved_predicate() {
        let task = LongtermTask::new(10, 4);

        let marker_step = |m: f32| {
            let mut d = vec![0.0f32; 10];
            d[1] = m;
            d[2] = 1.0 - m;
            d
        };
        let filler_step = || {
            let mut d = vec![0.0f32; 10];
            for slot in d.iter_mut().skip(2) {
                *slot = 1.0 / 8.0;
            }
            d
        };

        let good = vec![marker_step(0.95), filler_step(), filler_step(), marker_step(0.95)];
        assert!(task.solved(&Evidence::StepProbs(&good)));

        // Weak closing marker: long-range dependency not learned.
        let weak = vec![marker_step(0.95), filler_step(), filler_step(), marker_step(0.5)];
        assert!(!task.solved(&Evidence::StepProbs(&weak)));

        // Marker leaking into the middle.
        let leaky = vec![marker_step(0.95), marker_step(0.5), filler_step(), marker_step(0.95)];
        assert!(!task.solved(&Evidence::StepProbs(&leaky)));

        // Wrong evidence kind or length never solves.
        assert!(!task.solved(&Evidence::None));
        assert!(!task.solved(&Evidence::StepProbs(&good[..3])));
    }

    #[test]
    fn test_render_token() {
        assert_eq!(render_token(0), '_');
        assert_eq!(render_token(1), '|');
        assert_eq!(render_token(2), 'a');
        assert_eq!(render_token(3), 'b');
    }
}
