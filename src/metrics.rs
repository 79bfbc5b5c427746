// Logging and plotting collaborators.
//
// One tab-separated metrics line per logged iteration (Wdist, real error,
// generated error) appended to train.log, plus two SVG time-series charts
// that are re-rendered in place: training curves and gradient norms.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use plotters::prelude::*;

pub struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("train.log"))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, wdist: f32, err_real: f32, err_fake: f32) -> Result<()> {
        writeln!(self.writer, "{wdist}\t{err_real}\t{err_fake}")?;
        // Flushed per line: a crashed run keeps everything logged so far.
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory time series backing the charts.
#[derive(Default)]
pub struct History {
    pub wdist: Vec<f32>,
    pub err_real: Vec<f32>,
    pub err_fake: Vec<f32>,
    pub critic_grad: Vec<f32>,
    pub actor_grad: Vec<f32>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite training.svg and grad_norms.svg under `dir`.
    pub fn render(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let training = dir.join("training.svg");
        let grads = dir.join("grad_norms.svg");
        render_chart(
            &training,
            &[
                (&self.wdist, RED),
                (&self.err_real, BLUE),
                (&self.err_fake, GREEN),
            ],
        )?;
        render_chart(
            &grads,
            &[(&self.critic_grad, RED), (&self.actor_grad, BLUE)],
        )?;
        Ok((training, grads))
    }
}

fn render_chart(path: &Path, series: &[(&[f32], RGBColor)]) -> Result<()> {
    let root = SVGBackend::new(path, (900, 540)).into_drawing_area();
    root.fill(&WHITE)?;

    let n = series.iter().map(|(s, _)| s.len()).max().unwrap_or(0);
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for (s, _) in series {
        for &v in *s {
            if v.is_finite() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    if !lo.is_finite() || !hi.is_finite() {
        lo = 0.0;
        hi = 1.0;
    }
    if hi - lo < 1e-6 {
        hi = lo + 1.0;
    }
    let pad = (hi - lo) * 0.05;

    let mut chart = ChartBuilder::on(&root)
        .margin(12)
        .build_cartesian_2d(0f64..n.max(1) as f64, (lo - pad) as f64..(hi + pad) as f64)?;

    for (data, color) in series {
        let color = *color;
        chart.draw_series(LineSeries::new(
            data.iter().enumerate().map(|(i, &v)| (i as f64, v as f64)),
            &color,
        ))?;
    }
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = MetricsLog::create(dir.path())?;
        log.append(1.5, -0.25, 0.75)?;
        log.append(2.0, 0.0, 0.5)?;

        let text = std::fs::read_to_string(dir.path().join("train.log"))?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "1.5\t-0.25\t0.75");
        assert_eq!(lines[0].split('\t').count(), 3);
        Ok(())
    }

    #[test]
    fn test_log_appends_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut log = MetricsLog::create(dir.path())?;
            log.append(1.0, 2.0, 3.0)?;
        }
        {
            let mut log = MetricsLog::create(dir.path())?;
            log.append(4.0, 5.0, 6.0)?;
        }
        let text = std::fs::read_to_string(dir.path().join("train.log"))?;
        assert_eq!(text.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn test_render_overwrites_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut h = History::new();
        for i in 0..20 {
            h.wdist.push(i as f32 * 0.1);
            h.err_real.push(-(i as f32) * 0.05);
            h.err_fake.push(0.5);
            h.critic_grad.push(1.0 / (i + 1) as f32);
            h.actor_grad.push(0.3);
        }

        let (training, grads) = h.render(dir.path())?;
        assert!(training.exists());
        assert!(grads.exists());

        // Second render targets the same files.
        h.wdist.push(9.0);
        let (training2, _) = h.render(dir.path())?;
        assert_eq!(training, training2);
        Ok(())
    }

    #[test]
    fn test_render_empty_history() -> Result<()> {
        let dir = tempfile::tempdir()?;
        History::new().render(dir.path())?;
        Ok(())
    }
}
