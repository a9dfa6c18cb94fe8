//! Per-phase progress bars with a rolling window for long runs

use crate::io::configuration::MAX_INDIVIDUAL_PROGRESS_BARS;
use crate::pipeline::executor::PhaseReport;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::VecDeque;
use std::sync::{LazyLock, Mutex};

static PHASE_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {prefix:<32} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏ ")
});

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] Phases: [{bar:40.cyan/blue}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

/// Coordinates progress display for a run
///
/// One bar per phase; only the most recent phases stay on screen so long
/// runs do not flood the terminal. Runs with many phases also get an
/// overall bar.
pub struct ProgressManager {
    multi_progress: MultiProgress,
    run_bar: Option<ProgressBar>,
    visible: Mutex<VecDeque<ProgressBar>>,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressManager")
            .field("run_bar", &self.run_bar.is_some())
            .finish_non_exhaustive()
    }
}

impl ProgressManager {
    /// Progress drawn to stderr
    pub fn new() -> Self {
        Self {
            multi_progress: MultiProgress::new(),
            run_bar: None,
            visible: Mutex::new(VecDeque::new()),
        }
    }

    /// Progress that is tracked but never drawn
    pub fn hidden() -> Self {
        Self {
            multi_progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            run_bar: None,
            visible: Mutex::new(VecDeque::new()),
        }
    }

    /// Prepare for a run of `phase_count` phases
    pub fn initialize(&mut self, phase_count: usize) {
        if phase_count > MAX_INDIVIDUAL_PROGRESS_BARS + 1 {
            let bar = ProgressBar::new(phase_count as u64);
            bar.set_style(RUN_STYLE.clone());
            self.run_bar = Some(self.multi_progress.add(bar));
        }
    }

    /// Bar for a phase of `total` tasks
    pub fn phase_bar(&self, name: &str, total: usize) -> ProgressBar {
        let bar = self.multi_progress.add(ProgressBar::new(total as u64));
        bar.set_style(PHASE_STYLE.clone());
        bar.set_prefix(name.to_string());
        if let Ok(mut visible) = self.visible.lock() {
            visible.push_back(bar.clone());
            while visible.len() > MAX_INDIVIDUAL_PROGRESS_BARS {
                if let Some(oldest) = visible.pop_front() {
                    self.multi_progress.remove(&oldest);
                }
            }
        }
        bar
    }

    /// Mark a phase bar done with its timing
    pub fn finish_phase(&self, bar: &ProgressBar, report: &PhaseReport) {
        let message = if report.skipped > 0 {
            format!("✓ {:.1}s ({} resumed)", report.elapsed.as_secs_f64(), report.skipped)
        } else {
            format!("✓ {:.1}s", report.elapsed.as_secs_f64())
        };
        bar.finish_with_message(message);
        if let Some(run_bar) = &self.run_bar {
            run_bar.inc(1);
        }
    }

    /// Clean up all progress displays
    pub fn finish(&self) {
        if let Some(run_bar) = &self.run_bar {
            run_bar.finish_with_message("All phases complete");
        }
        let _ = self.multi_progress.clear();
    }
}
