// Run statistics: per-task accounting and the shutdown summary

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::engine::command::Encoder;
use crate::engine::pipeline::{TaskOutcome, TaskReport};
use crate::engine::scheduler::SchedulerSnapshot;

/// Aggregate counters for one batch run, folded in as reports arrive.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub found: usize,
    pub queued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skip_size: usize,
    pub skip_exists: usize,
    pub encoder_usage: BTreeMap<Encoder, u64>,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub started: Instant,
}

impl RunSummary {
    pub fn new(found: usize, queued: usize, pre_skipped_existing: usize) -> Self {
        Self {
            found,
            queued,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            skip_size: 0,
            skip_exists: pre_skipped_existing,
            encoder_usage: BTreeMap::new(),
            input_bytes: 0,
            output_bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, report: &TaskReport) {
        match &report.outcome {
            TaskOutcome::Success => {
                self.succeeded += 1;
                self.input_bytes += report.stats.original_size;
                self.output_bytes += report.stats.new_size;
                if let Some(encoder) = report.encoder_used {
                    *self.encoder_usage.entry(encoder).or_insert(0) += 1;
                }
            }
            TaskOutcome::SkipSize => self.skip_size += 1,
            TaskOutcome::SkipExists => self.skip_exists += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.cancelled + self.skip_size + self.skip_exists
    }

    /// 0: everything succeeded or was skipped. 1: something failed.
    /// 130: the run was interrupted.
    pub fn exit_code(&self, interrupted: bool) -> i32 {
        if interrupted {
            130
        } else if self.failed > 0 || self.cancelled > 0 {
            1
        } else {
            0
        }
    }

    pub fn space_saved(&self) -> String {
        let saved = self.input_bytes as i64 - self.output_bytes as i64;
        if saved >= 0 {
            format!("{} saved", format_bytes(saved as u64))
        } else {
            format!("{} larger", format_bytes((-saved) as u64))
        }
    }

    /// The end-of-run report, mirroring the startup banner.
    pub fn log_summary(&self, scheduler: &SchedulerSnapshot, log_path: Option<&Path>) {
        let elapsed = self.started.elapsed().as_secs_f64();
        info!("{}", "=".repeat(60));
        info!("run complete in {:.1} min", elapsed / 60.0);
        info!(
            "found {}, processed {}: {} succeeded, {} skipped (size), {} skipped (exists), {} failed, {} cancelled",
            self.found,
            self.queued,
            self.succeeded,
            self.skip_size,
            self.skip_exists,
            self.failed,
            self.cancelled
        );
        if self.succeeded > 0 {
            info!(
                "{} in -> {} out ({})",
                format_bytes(self.input_bytes),
                format_bytes(self.output_bytes),
                self.space_saved()
            );
        }
        if !self.encoder_usage.is_empty() {
            let usage: Vec<String> = self
                .encoder_usage
                .iter()
                .map(|(encoder, count)| format!("{encoder}: {count}"))
                .collect();
            info!("encoder usage: {}", usage.join(", "));
        }
        for (encoder, slot) in &scheduler.slots {
            info!(
                "  {:<14} completed {}, failed {}",
                encoder.to_string(),
                slot.completed,
                slot.failed
            );
        }
        if let Some(path) = log_path {
            info!("log file: {}", path.display());
        }
        info!("{}", "=".repeat(60));
    }
}

/// Format bytes in human-readable form (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
