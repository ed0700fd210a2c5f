//! Scan-wide counters and progress reporting.
//!
//! Mirrors `original_source/src/stats.py`: a small mutable bag of counters,
//! owned exclusively by the engine and written to under its single
//! serialization point (see `engine.rs`).

use chrono::{DateTime, Local};
use std::fmt;

/// Running totals for one `torscan` invocation across however many modules
/// have been run so far.
#[derive(Debug)]
pub struct Statistics {
    start_time: DateTime<Local>,
    pub total_circuits: u64,
    pub failed_circuits: u64,
    pub successful_circuits: u64,
    pub finished_streams: u64,
    pub modules_run: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            total_circuits: 0,
            failed_circuits: 0,
            successful_circuits: 0,
            finished_streams: 0,
            modules_run: 0,
        }
    }

    /// Reset the per-module counters ahead of a new module invocation,
    /// keeping `modules_run` and the start time.
    pub fn begin_module(&mut self) {
        self.modules_run += 1;
        self.total_circuits = 0;
        self.failed_circuits = 0;
        self.successful_circuits = 0;
        self.finished_streams = 0;
    }

    /// Log a progress line every `sampling`th successfully built circuit.
    pub fn print_progress(&self, sampling: u64) {
        if self.successful_circuits == 0 || self.successful_circuits % sampling != 0 {
            return;
        }
        let percent_done = (100.0 / self.total_circuits as f64) * self.successful_circuits as f64;
        tracing::info!(
            "probed {} out of {} exit relays, {:.2}% done",
            self.successful_circuits,
            self.total_circuits,
            percent_done
        );
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "determining scan statistics.")?;
        writeln!(f, "ran {} module(s).", self.modules_run)?;
        writeln!(
            f,
            "{} of {} circuits failed.",
            self.failed_circuits, self.total_circuits
        )?;
        let elapsed = Local::now().signed_duration_since(self.start_time);
        write!(f, "scan time: {}s.", elapsed.num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_only_samples_every_nth_success() {
        let mut stats = Statistics::new();
        stats.total_circuits = 100;
        for i in 1..=20 {
            stats.successful_circuits = i;
            // Can't assert on logging output, just make sure it never panics
            // and the percentage math stays sane at the sampled points.
            if i % 10 == 0 {
                let percent = (100.0 / stats.total_circuits as f64) * stats.successful_circuits as f64;
                assert!((0.0..=100.0).contains(&percent));
            }
            stats.print_progress(10);
        }
    }

    #[test]
    fn display_reports_failure_ratio() {
        let mut stats = Statistics::new();
        stats.total_circuits = 2;
        stats.successful_circuits = 1;
        stats.failed_circuits = 1;
        stats.modules_run = 1;
        let text = stats.to_string();
        assert!(text.contains("1 of 2 circuits failed"));
    }
}
