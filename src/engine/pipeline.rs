// Per-file fallback pipeline: preflight, attempt plan, execute, finalize

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;

use super::command::{
    AttemptSpec, AudioPlan, Codec, DecodeMode, EncodeCommand, Encoder, build_command, encoder_tag,
    hw_decode_whitelist, plan_audio,
};
use super::detect::DetectedEncoders;
use super::paths::{PathError, PlannedPaths, resolve_output_paths};
use super::probe::{self, MediaInfo};
use super::process::{AttemptError, CancelToken, ProcessRunner, dynamic_timeout};
use super::scheduler::Scheduler;

/// The subprocess seam. The production impl is `ProcessRunner`; tests script
/// outcomes through it to drive the fallback machinery deterministically.
pub trait AttemptRunner: Send + Sync {
    fn run(&self, cmd: &EncodeCommand, timeout: Duration) -> Result<(), AttemptError>;
}

impl AttemptRunner for ProcessRunner {
    fn run(&self, cmd: &EncodeCommand, timeout: Duration) -> Result<(), AttemptError> {
        ProcessRunner::run(self, cmd, timeout)
    }
}

/// Collaborators a task needs, injected rather than ambient.
pub struct TaskContext<'a> {
    pub cfg: &'a Config,
    pub detected: &'a DetectedEncoders,
    pub scheduler: &'a Arc<Scheduler>,
    pub runner: &'a dyn AttemptRunner,
    pub cancel: &'a CancelToken,
}

/// Terminal failure of a whole task (individual attempt errors live in
/// `AttemptError` and the retry history).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskFailure {
    #[error("{0}")]
    PathEscape(String),

    #[error("no usable encoder for this run")]
    NoEncoders,

    #[error("all encode attempts failed; last error: {0}")]
    PlanExhausted(AttemptError),

    #[error("failed to finalize output: {0}")]
    Finalize(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success,
    SkipExists,
    SkipSize,
    Cancelled,
    Failed(TaskFailure),
}

impl TaskOutcome {
    /// Skips are not errors; only Failed and Cancelled count against the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_) | TaskOutcome::Cancelled)
    }
}

/// One executed attempt, as recorded in the retry history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub encoder: Encoder,
    pub decode_mode: DecodeMode,
    /// Method label as actually run, including tolerance/audio annotations.
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub original_size: u64,
    pub new_size: u64,
    pub target_bitrate: u64,
    pub encode_time_s: f64,
}

/// Structured result of one task. Errors never escape the worker; they end
/// up here.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub outcome: TaskOutcome,
    pub retry_history: Vec<AttemptRecord>,
    pub encoder_used: Option<Encoder>,
    pub stats: TaskStats,
}

impl TaskReport {
    fn new(input: &Path, outcome: TaskOutcome) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            input: input.to_path_buf(),
            output: None,
            outcome,
            retry_history: Vec::new(),
            encoder_used: None,
            stats: TaskStats::default(),
        }
    }

    /// "nvenc hw-decode → qsv sw-decode" style summary for progress lines.
    pub fn retry_path(&self) -> String {
        self.retry_history
            .iter()
            .map(|a| a.label.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Compute the ordered fallback chain for one file. Built once at admission;
/// execution never deviates from it, which is what makes the fallback
/// behavior testable.
pub fn build_attempt_plan(
    detected: &DetectedEncoders,
    source_codec: &str,
    output_codec: Codec,
) -> Vec<AttemptSpec> {
    let mut plan = Vec::new();

    for encoder in detected.hardware() {
        if encoder_tag(encoder, output_codec).is_none() {
            continue;
        }
        if hw_decode_whitelist(encoder).contains(&source_codec) {
            plan.push(AttemptSpec {
                encoder,
                decode_mode: DecodeMode::HwDecode,
                codec: output_codec,
            });
        }
        plan.push(AttemptSpec {
            encoder,
            decode_mode: DecodeMode::SwDecodeLimited,
            codec: output_codec,
        });
        plan.push(AttemptSpec {
            encoder,
            decode_mode: DecodeMode::SwDecode,
            codec: output_codec,
        });
    }

    if detected.cpu_available() {
        if encoder_tag(Encoder::Cpu, output_codec).is_some() {
            plan.push(AttemptSpec {
                encoder: Encoder::Cpu,
                decode_mode: DecodeMode::SwDecodeLimited,
                codec: output_codec,
            });
            plan.push(AttemptSpec {
                encoder: Encoder::Cpu,
                decode_mode: DecodeMode::SwDecode,
                codec: output_codec,
            });
        }
        // Last-resort compatibility: plain AVC software encode.
        if output_codec != Codec::Avc {
            plan.push(AttemptSpec {
                encoder: Encoder::Cpu,
                decode_mode: DecodeMode::SwDecode,
                codec: Codec::Avc,
            });
        }
    }

    plan
}

/// Run one input file through the full pipeline using the real prober.
pub fn run_task(ctx: &TaskContext, input: &Path) -> TaskReport {
    run_task_with_probe(ctx, input, probe::probe)
}

/// Same, with the metadata probe injected (the probe seam for tests and for
/// callers that already hold metadata).
pub fn run_task_with_probe(
    ctx: &TaskContext,
    input: &Path,
    probe_fn: impl FnOnce(&Path) -> MediaInfo,
) -> TaskReport {
    if ctx.cancel.is_cancelled() {
        return TaskReport::new(input, TaskOutcome::Cancelled);
    }

    // Preflight: output mapping (and the traversal guard) comes first so a
    // hostile path never reaches a subprocess.
    let planned = match resolve_output_paths(
        input,
        &ctx.cfg.paths.input,
        &ctx.cfg.paths.output,
        ctx.cfg.files.keep_structure,
    ) {
        Ok(planned) => planned,
        Err(e @ (PathError::InputEscapesRoot { .. } | PathError::OutputEscapesRoot { .. })) => {
            error!(file = %input.display(), "path safety violation: {e}");
            return TaskReport::new(
                input,
                TaskOutcome::Failed(TaskFailure::PathEscape(e.to_string())),
            );
        }
        Err(e) => {
            error!(file = %input.display(), "cannot resolve output path: {e}");
            return TaskReport::new(
                input,
                TaskOutcome::Failed(TaskFailure::PathEscape(e.to_string())),
            );
        }
    };

    if ctx.cfg.files.skip_existing && planned.output.exists() {
        info!(file = %input.display(), "skip: output already exists");
        let mut report = TaskReport::new(input, TaskOutcome::SkipExists);
        report.output = Some(planned.output);
        return report;
    }

    let original_size = match fs::metadata(input) {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!(file = %input.display(), "cannot stat input: {e}");
            return TaskReport::new(
                input,
                TaskOutcome::Failed(TaskFailure::Finalize(format!("cannot stat input: {e}"))),
            );
        }
    };

    let min_bytes = ctx.cfg.files.min_size_mb * 1024 * 1024;
    if original_size < min_bytes {
        info!(
            file = %input.display(),
            "skip: {} below the {}MB threshold",
            crate::stats::format_bytes(original_size),
            ctx.cfg.files.min_size_mb
        );
        let mut report = TaskReport::new(input, TaskOutcome::SkipSize);
        report.stats.original_size = original_size;
        return report;
    }

    let meta = probe_fn(input);
    let target_bps = super::planner::plan_target_bitrate(&meta, &ctx.cfg.encoding.bitrate);
    let timeout = dynamic_timeout(meta.duration_s);

    debug!(
        file = %input.display(),
        codec = %meta.source_codec,
        "{}x{} {:.1}fps {:.2}Mbps -> target {:.2}Mbps",
        meta.width,
        meta.height,
        meta.fps,
        meta.video_bitrate_bps as f64 / 1e6,
        target_bps as f64 / 1e6,
    );

    // Outcome is overwritten once the plan has run.
    let mut report = TaskReport::new(input, TaskOutcome::Cancelled);
    report.stats.original_size = original_size;
    report.stats.target_bitrate = target_bps;

    let plan = build_attempt_plan(ctx.detected, &meta.source_codec, ctx.cfg.encoding.codec);
    if plan.is_empty() {
        report.outcome = TaskOutcome::Failed(TaskFailure::NoEncoders);
        return report;
    }

    if let Some(parent) = planned.output.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            report.outcome = TaskOutcome::Failed(TaskFailure::Finalize(format!(
                "cannot create output directory {}: {e}",
                parent.display()
            )));
            return report;
        }
    }

    let audio = plan_audio(&ctx.cfg.encoding.audio, meta.audio_bitrate_bps);
    let started = Instant::now();
    let outcome = execute_plan(ctx, input, &planned, &plan, &audio, target_bps, timeout, &mut report);
    report.stats.encode_time_s = started.elapsed().as_secs_f64();
    report.outcome = outcome;
    report
}

#[allow(clippy::too_many_arguments)]
fn execute_plan(
    ctx: &TaskContext,
    input: &Path,
    planned: &PlannedPaths,
    plan: &[AttemptSpec],
    audio: &AudioPlan,
    target_bps: u64,
    timeout: Duration,
    report: &mut TaskReport,
) -> TaskOutcome {
    let mut last_error = None;

    for spec in plan {
        if ctx.cancel.is_cancelled() {
            remove_temp(&planned.temp);
            return TaskOutcome::Cancelled;
        }

        let lease = match ctx.scheduler.acquire(spec.encoder, ctx.cancel) {
            Ok(lease) => lease,
            Err(_) => {
                remove_temp(&planned.temp);
                return TaskOutcome::Cancelled;
            }
        };

        let Some(cmd) = build_command(
            spec,
            input,
            &planned.temp,
            target_bps,
            &ctx.cfg.fps,
            ctx.cfg.encoders.cpu_preset(),
            &audio.args,
        ) else {
            // No tag for this (encoder, codec); nothing was attempted.
            debug!(file = %input.display(), "{} cannot produce {}, skipping", spec.encoder, spec.codec);
            lease.release();
            continue;
        };

        let (result, label) = run_with_recovery(ctx, input, &cmd, spec, audio, target_bps, timeout);

        report.retry_history.push(AttemptRecord {
            encoder: spec.encoder,
            decode_mode: spec.decode_mode,
            label,
        });

        match result {
            Ok(()) => {
                lease.finish(true);
                report.encoder_used = Some(spec.encoder);
                return finalize_output(ctx, planned, report);
            }
            Err(AttemptError::Cancelled) => {
                lease.release();
                remove_temp(&planned.temp);
                return TaskOutcome::Cancelled;
            }
            Err(e) => {
                warn!(
                    file = %input.display(),
                    "attempt failed ({} {}): {e}",
                    spec.encoder,
                    spec.decode_mode.label()
                );
                lease.finish(false);
                remove_temp(&planned.temp);
                last_error = Some(e);
            }
        }
    }

    let last = last_error.unwrap_or(AttemptError::Other("no attempt was runnable".to_string()));
    TaskOutcome::Failed(TaskFailure::PlanExhausted(last))
}

/// Run one attempt with its local recovery ladder: corruption-tolerance
/// retries on the same command, then one audio rebuild if copy was the
/// first choice. Returns the final result and the method label that ran.
fn run_with_recovery(
    ctx: &TaskContext,
    input: &Path,
    cmd: &EncodeCommand,
    spec: &AttemptSpec,
    audio: &AudioPlan,
    target_bps: u64,
    timeout: Duration,
) -> (Result<(), AttemptError>, String) {
    let recovery = &ctx.cfg.error_recovery;

    log_command(ctx, input, cmd);
    let mut label = cmd.label.clone();
    let mut result = ctx.runner.run(cmd, timeout);

    let corrupt_source = matches!(&result, Err(e) if e.is_decode_corruption());
    if corrupt_source
        && recovery.retry_decode_errors_with_ignore
        && recovery.max_ignore_retries_per_method > 0
    {
        let tolerant = cmd.with_tolerance_flags();
        if tolerant != *cmd {
            for retry in 1..=recovery.max_ignore_retries_per_method {
                warn!(
                    file = %input.display(),
                    "source looks corrupt, tolerant retry {retry}/{}",
                    recovery.max_ignore_retries_per_method
                );
                log_command(ctx, input, &tolerant);
                result = ctx.runner.run(&tolerant, timeout);
                if result.is_ok() {
                    label = tolerant.label.clone();
                    break;
                }
            }
        } else {
            debug!(file = %input.display(), "tolerance flags already present, not re-injecting");
        }
    }

    // Copy-first audio gets one transcode rebuild, regardless of what failed.
    if result.is_err() && !matches!(&result, Err(AttemptError::Cancelled)) {
        if let Some(retry_args) = &audio.retry_args {
            if let Some(retry_cmd) = build_command(
                spec,
                input,
                &cmd.output,
                target_bps,
                &ctx.cfg.fps,
                ctx.cfg.encoders.cpu_preset(),
                retry_args,
            ) {
                warn!(file = %input.display(), "audio copy failed, retrying with transcode");
                log_command(ctx, input, &retry_cmd);
                result = ctx.runner.run(&retry_cmd, timeout);
                if result.is_ok() {
                    label = format!("{} + audio transcode", retry_cmd.label);
                }
            }
        }
    }

    (result, label)
}

fn finalize_output(ctx: &TaskContext, planned: &PlannedPaths, report: &mut TaskReport) -> TaskOutcome {
    // skip_existing is honored again at the last moment: another run may have
    // produced the output while we were encoding.
    if ctx.cfg.files.skip_existing && planned.output.exists() {
        remove_temp(&planned.temp);
        report.output = Some(planned.output.clone());
        return TaskOutcome::SkipExists;
    }

    match fs::rename(&planned.temp, &planned.output) {
        Ok(()) => {
            report.output = Some(planned.output.clone());
            report.stats.new_size = fs::metadata(&planned.output).map(|m| m.len()).unwrap_or(0);
            TaskOutcome::Success
        }
        Err(e) => {
            remove_temp(&planned.temp);
            TaskOutcome::Failed(TaskFailure::Finalize(format!(
                "rename {} -> {}: {e}",
                planned.temp.display(),
                planned.output.display()
            )))
        }
    }
}

fn log_command(ctx: &TaskContext, input: &Path, cmd: &EncodeCommand) {
    if ctx.cfg.logging.print_cmd {
        info!(file = %input.display(), "[{}] {}", cmd.label, cmd.rendered());
    } else {
        debug!(file = %input.display(), "[{}] {}", cmd.label, cmd.rendered());
    }
}

fn remove_temp(temp: &Path) {
    if temp.exists() {
        if let Err(e) = fs::remove_file(temp) {
            warn!("could not remove temp file {}: {e}", temp.display());
        }
    }
}
