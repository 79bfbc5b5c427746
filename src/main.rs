// seqgan unified binary
//
// Commands:
//   seqgan train  [flags]    Adversarial training loop
//   seqgan sample [flags]    Generate sequences from a saved actor
//
// Config tiers: test (tiny, CPU-fast) and default (full toy-task sizes);
// individual flags override the chosen tier.

use seqgan::actor::Actor;
use seqgan::config::{Options, ReplayKind};
use seqgan::net::load_checkpoint;
use seqgan::task::build_task;
use seqgan::training::{device, Trainer};

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "train" => parse_options(&args[2..]).and_then(cmd_train),
        "sample" => parse_options(&args[2..]).and_then(cmd_sample),
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("[SEQGAN] Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: seqgan <train|sample> [flags]");
    eprintln!();
    eprintln!("Flags:");
    eprintln!("  --config test|default   Size tier (default: default)");
    eprintln!("  --task words|longterm   Task to train against");
    eprintln!("  --niter N               Outer iteration budget");
    eprintln!("  --eps X                 Exploration rate in [0, 1]");
    eprintln!("  --replay uniform|recent Replay sampling strategy");
    eprintln!("  --out DIR               Output directory");
    eprintln!("  --seed N                RNG seed");
}

/// Tier selection plus per-flag overrides. The tier is resolved in a first
/// pass so the other flags win regardless of where --config appears.
/// Unknown flags and missing or malformed values are fatal.
fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut opt = Options::default_opts();
    for (i, flag) in args.iter().enumerate() {
        if flag == "--config" {
            let tier = args
                .get(i + 1)
                .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
            opt = match tier.as_str() {
                "test" => Options::test(),
                "default" => Options::default_opts(),
                other => anyhow::bail!("unknown config tier '{other}'"),
            };
        }
    }

    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let mut value = || {
            it.next()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match flag.as_str() {
            "--config" => {
                value()?; // consumed in the first pass
            }
            "--task" => opt.task = value()?.clone(),
            "--niter" => opt.niter = value()?.parse()?,
            "--eps" => opt.eps = value()?.parse()?,
            "--replay" => {
                let kind = value()?;
                opt.replay = ReplayKind::from_str(kind)
                    .ok_or_else(|| anyhow::anyhow!("unknown replay kind '{kind}'"))?;
            }
            "--out" => opt.out_dir = value()?.clone(),
            "--seed" => opt.seed = value()?.parse()?,
            other => anyhow::bail!("unknown flag '{other}'"),
        }
    }
    opt.validate()?;
    Ok(opt)
}

fn cmd_train(opt: Options) -> anyhow::Result<()> {
    let device = device()?;
    eprintln!(
        "[SEQGAN] task={} vocab={} batch={} seq={} replay={:?} out={}",
        opt.task, opt.vocab_size, opt.batch_size, opt.seq_len, opt.replay, opt.out_dir
    );

    let mut trainer = Trainer::new(opt, device)?;
    let summary = trainer.run()?;
    eprintln!(
        "[SEQGAN] done: {} iterations, solved={}",
        summary.iterations, summary.solved
    );
    Ok(())
}

fn cmd_sample(opt: Options) -> anyhow::Result<()> {
    let device = device()?;
    let task = build_task(&opt)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let actor = Actor::new(&opt, vb)?;

    let ckpt = std::path::Path::new(&opt.out_dir).join("actor.safetensors");
    anyhow::ensure!(
        ckpt.exists(),
        "no actor checkpoint at {}; run 'seqgan train' first",
        ckpt.display()
    );
    load_checkpoint(&varmap, &ckpt.to_string_lossy(), &device)?;

    let mut rng = StdRng::seed_from_u64(opt.seed);
    let generation = actor.generate(0.0, &mut rng, &device)?;
    task.display(&generation.tokens.to_vec2::<u32>()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flag_overrides_survive_any_config_position() {
        // Tier after the override must not discard it.
        let opt = parse_options(&argv(&["--task", "longterm", "--config", "test"])).unwrap();
        assert_eq!(opt.task, "longterm");
        assert_eq!(opt.batch_size, Options::test().batch_size);

        let opt = parse_options(&argv(&["--config", "test", "--task", "longterm"])).unwrap();
        assert_eq!(opt.task, "longterm");
        assert_eq!(opt.batch_size, Options::test().batch_size);
    }

    #[test]
    fn test_bad_flags_are_fatal() {
        assert!(parse_options(&argv(&["--config"])).is_err());
        assert!(parse_options(&argv(&["--config", "huge"])).is_err());
        assert!(parse_options(&argv(&["--bogus", "1"])).is_err());
        assert!(parse_options(&argv(&["--replay", "fifo"])).is_err());
    }
}
