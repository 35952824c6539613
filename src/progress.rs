// ABOUTME: Progress supervision for long-running external tools
// ABOUTME: Races a fixed-interval ticker against task completion and renders an indicatif bar

use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Sampling interval while a tool runs
pub const TICK: Duration = Duration::from_millis(500);

/// Assumed restore throughput (20 MiB per minute)
///
/// Restore tools give no byte-level progress, so restore progress is an
/// estimate derived from elapsed time at this rate, never a measurement.
pub const ESTIMATED_RESTORE_BYTES_PER_SEC: u64 = 20 * 1024 * 1024 / 60;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({percent}%)";

/// What to observe on each tick
#[derive(Debug, Clone)]
pub enum ProgressSampler {
    /// Byte size of a growing dump file or directory
    ArtifactSize { path: PathBuf },
    /// Time-based guess at how much of `total_bytes` has been restored
    EstimatedRestore { total_bytes: u64 },
}

impl ProgressSampler {
    fn sample(&self, elapsed: Duration) -> Option<u64> {
        match self {
            // The artifact may not exist yet during the first ticks
            ProgressSampler::ArtifactSize { path } => artifact_size(path).ok(),
            ProgressSampler::EstimatedRestore { total_bytes } => {
                Some(estimate_restored_bytes(elapsed, *total_bytes))
            }
        }
    }
}

/// Estimated bytes restored after `elapsed`, capped at `total_bytes`
pub fn estimate_restored_bytes(elapsed: Duration, total_bytes: u64) -> u64 {
    let estimate = elapsed.as_secs_f64() * ESTIMATED_RESTORE_BYTES_PER_SEC as f64;
    (estimate as u64).min(total_bytes)
}

/// Total size of a file, or of all files below a directory
pub fn artifact_size(path: &Path) -> io::Result<u64> {
    let metadata = std::fs::metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += artifact_size(&entry.path())?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Create a byte progress bar, or a hidden one when output is not interactive
pub fn new_bar(visible: bool, total_bytes: u64, message: impl Into<String>) -> ProgressBar {
    let bar = if visible {
        ProgressBar::new(total_bytes)
    } else {
        ProgressBar::hidden()
    };
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(message.into());
    bar
}

/// Drive `task` to completion while sampling progress every [`TICK`]
///
/// The task is polled before the ticker on every wake-up, so once it has
/// finished no further tick is rendered. The caller finishes the bar.
pub async fn supervise<F, T>(task: F, bar: &ProgressBar, sampler: &ProgressSampler) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(task);

    let started = Instant::now();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            output = &mut task => return output,
            _ = ticker.tick() => {
                if let Some(position) = sampler.sample(started.elapsed()) {
                    let length = bar.length().unwrap_or(0);
                    bar.set_position(if length > 0 { position.min(length) } else { position });
                }
            }
        }
    }
}
