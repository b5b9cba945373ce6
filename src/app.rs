use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use ffbatch::config::Config;
use ffbatch::engine::worker::{WorkerEvent, WorkerPool};
use ffbatch::engine::{self, CancelToken, Encoder, ProcessTable, Scheduler, detect};
use ffbatch::stats::RunSummary;

pub fn run(cli: Cli) -> i32 {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 1;
        }
    };

    apply_cli_overrides(&mut config, &cli);

    let log_path = match init_logging(&config, cli.verbose, cli.quiet) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error initializing logging: {e:#}");
            return 1;
        }
    };

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("config: {err}");
        }
        return 1;
    }

    if let Some(command) = cli.command {
        return match command {
            Commands::CheckEncoders => handle_check_encoders(&config),
            Commands::Probe { file } => handle_probe(&file),
            Commands::InitConfig => handle_init_config(),
        };
    }

    match run_batch(&config, log_path.as_deref()) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(input) = &cli.input {
        config.paths.input = input.clone();
    }
    if let Some(output) = &cli.output {
        config.paths.output = output.clone();
    }
    if let Some(codec) = cli.codec {
        config.encoding.codec = codec;
    }
    if let Some(bps) = cli.force_bitrate {
        config.encoding.bitrate.forced = bps;
    }
    if let Some(fps) = cli.max_fps {
        config.fps.max = fps;
    }
    if let Some(mb) = cli.min_size {
        config.files.min_size_mb = mb;
    }
    if cli.no_keep_structure {
        config.files.keep_structure = false;
    }
    if cli.overwrite {
        config.files.skip_existing = false;
    }
    if let Some(n) = cli.max_concurrent {
        config.scheduler.max_total_concurrent = n;
    }
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.print_cmd {
        config.logging.print_cmd = true;
    }
}

/// Console layer at the CLI-selected level plus, when `paths.log` is set, a
/// debug-level file layer writing one timestamped log per run. Returns the
/// log file's path so the final summary can point at it.
fn init_logging(config: &Config, verbose: u8, quiet: u8) -> Result<Option<PathBuf>> {
    let console_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 2 {
        "trace"
    } else if verbose == 1 {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(console_level));

    let (file_layer, log_path) = match &config.paths.log {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let name = format!("ffbatch_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));
            let path = dir.join(&name);
            let file = fs::File::create(&path)
                .with_context(|| format!("Failed to create log file: {name}"))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
    Ok(log_path)
}

fn handle_check_encoders(config: &Config) -> i32 {
    match detect::ffmpeg_version() {
        Some(version) => println!("{version}"),
        None => {
            eprintln!("Error: ffmpeg not found on PATH");
            return 1;
        }
    }

    let detected = detect::detect(&config.encoders, config.encoding.codec);
    println!(
        "Usable encoders for {} output:",
        config.encoding.codec
    );
    for encoder in Encoder::ALL {
        if detected.is_available(encoder) {
            println!(
                "  {:<20} available (max {} concurrent)",
                encoder.display_name(),
                config.encoders.pool(encoder).max_concurrent
            );
        } else {
            println!(
                "  {:<20} unavailable: {}",
                encoder.display_name(),
                detected.reason(encoder).unwrap_or("not probed")
            );
        }
    }

    if detected.available().is_empty() { 1 } else { 0 }
}

fn handle_probe(file: &Path) -> i32 {
    if !file.exists() {
        eprintln!("Error: {} does not exist", file.display());
        return 1;
    }
    let meta = engine::probe(file);
    println!("codec:         {}", meta.source_codec);
    println!("resolution:    {}x{}", meta.width, meta.height);
    println!("fps:           {:.3}", meta.fps);
    println!("duration:      {:.1}s", meta.duration_s);
    println!("video bitrate: {} bps", meta.video_bitrate_bps);
    match meta.audio_bitrate_bps {
        Some(bps) => println!("audio bitrate: {bps} bps"),
        None => println!("audio bitrate: unknown"),
    }
    0
}

fn handle_init_config() -> i32 {
    match Config::ensure_default() {
        Ok(path) => {
            println!("Config file: {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

fn run_batch(config: &Config, log_path: Option<&Path>) -> Result<i32> {
    let input_root = &config.paths.input;
    let output_root = &config.paths.output;

    info!("{}", "=".repeat(60));
    info!("ffbatch - batch video transcoder");
    info!("{}", "=".repeat(60));
    info!("input:  {}", input_root.display());
    info!("output: {}", output_root.display());
    info!(
        "codec: {} | keep structure: {} | skip existing: {}",
        config.encoding.codec, config.files.keep_structure, config.files.skip_existing
    );
    let recovery = &config.error_recovery;
    if recovery.retry_decode_errors_with_ignore && recovery.max_ignore_retries_per_method > 0 {
        info!(
            "decode-error tolerance: enabled ({} retry per method)",
            recovery.max_ignore_retries_per_method
        );
    } else {
        info!("decode-error tolerance: disabled");
    }
    info!("fallback: hw-decode+hw-encode -> sw-decode+hw-encode -> next encoder -> cpu");
    info!("{}", "-".repeat(60));

    if !input_root.exists() {
        error!("input directory does not exist: {}", input_root.display());
        return Ok(1);
    }
    if !input_root.is_dir() {
        error!("input path is not a directory: {}", input_root.display());
        return Ok(1);
    }
    // An unreadable root would otherwise surface as an empty scan.
    if let Err(e) = fs::read_dir(input_root) {
        error!("input directory is not readable: {}: {e}", input_root.display());
        return Ok(1);
    }
    if input_root
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        warn!("input directory is a symlink: {}", input_root.display());
    }

    let files = engine::scan(input_root)?;
    let found = files.len();
    if found == 0 {
        warn!("no video files found under {}", input_root.display());
        return Ok(0);
    }
    info!("found {found} video files");

    preview_mappings(config, &files);

    if config.dry_run {
        info!("[dry run] preview only, nothing will be encoded");
        for (i, file) in files.iter().take(10).enumerate() {
            info!("  {}. {}", i + 1, file.display());
        }
        if found > 10 {
            info!("  ... and {} more", found - 10);
        }
        return Ok(0);
    }

    info!("detecting usable encoders...");
    let detected = detect::detect(&config.encoders, config.encoding.codec);
    detect::log_report(&config.encoders, &detected);
    if detected.available().is_empty() {
        error!("no usable encoder on this host");
        return Ok(1);
    }
    info!("global concurrency cap: {}", config.scheduler.max_total_concurrent);
    info!("{}", "-".repeat(60));

    fs::create_dir_all(output_root)
        .with_context(|| format!("Failed to create output directory: {}", output_root.display()))?;

    // Pre-pass: drop inputs whose output already exists so they never occupy
    // a worker; with skip_existing off we only warn about the overwrites.
    let mut queued = Vec::new();
    let mut pre_skipped = 0usize;
    let mut overwrites = 0usize;
    for file in files {
        match engine::paths::resolve_output_paths(
            file.as_path(),
            input_root,
            output_root,
            config.files.keep_structure,
        ) {
            Ok(planned) if planned.output.exists() && config.files.skip_existing => {
                info!("skip (exists): {}", planned.output.display());
                pre_skipped += 1;
            }
            Ok(planned) => {
                if planned.output.exists() {
                    overwrites += 1;
                }
                queued.push(file);
            }
            // Deliberately queued: the pipeline fails it with the full report.
            Err(_) => queued.push(file),
        }
    }
    if pre_skipped > 0 {
        info!("pre-pass: {pre_skipped} outputs already exist, skipped");
    }
    if overwrites > 0 {
        warn!("pre-pass: {overwrites} outputs exist and will be overwritten (skip_existing=false)");
    }
    info!("queued: {} files", queued.len());

    let cancel = CancelToken::new();
    let table = ProcessTable::new();
    {
        let cancel = cancel.clone();
        let table = table.clone();
        ctrlc::set_handler(move || {
            eprintln!("interrupt received, stopping encoders...");
            cancel.cancel();
            table.terminate_all();
        })
        .context("Failed to install signal handler")?;
    }

    let config = Arc::new(config.clone());
    let detected = Arc::new(detected);
    let scheduler = Scheduler::new(&config, &detected);
    let workers = config.scheduler.max_total_concurrent;
    let pool = WorkerPool::spawn(
        workers,
        Arc::clone(&config),
        Arc::clone(&detected),
        Arc::clone(&scheduler),
        table,
        cancel.clone(),
    );

    let total = queued.len();
    let mut summary = RunSummary::new(found, total, pre_skipped);
    for file in queued {
        pool.submit(file);
    }

    let mut finished = 0usize;
    while finished < total {
        match pool.events().recv() {
            Ok(WorkerEvent::TaskStarted { input, .. }) => {
                info!("encoding: {}", input.display());
            }
            Ok(WorkerEvent::TaskFinished { report, .. }) => {
                finished += 1;
                summary.record(&report);
                if config.logging.show_progress {
                    let retry_path = report.retry_path();
                    let suffix = if retry_path.is_empty() {
                        String::new()
                    } else {
                        format!(" [path: {retry_path}]")
                    };
                    info!(
                        "[{}/{}] ({:.1}%) {}{}",
                        finished,
                        total,
                        finished as f64 / total as f64 * 100.0,
                        report.input.display(),
                        suffix
                    );
                }
            }
            Err(_) => break,
        }
    }
    pool.join();

    summary.log_summary(&scheduler.stats(), log_path);
    Ok(summary.exit_code(cancel.is_cancelled()))
}

fn preview_mappings(config: &Config, files: &[std::path::PathBuf]) {
    if !config.files.keep_structure {
        warn!("keep_structure is off: all outputs land in one directory");
    }
    for (i, file) in files.iter().take(3).enumerate() {
        if let Ok(planned) = engine::paths::resolve_output_paths(
            file,
            &config.paths.input,
            &config.paths.output,
            config.files.keep_structure,
        ) {
            info!("  {}. {} -> {}", i + 1, file.display(), planned.output.display());
        }
    }
    if files.len() > 3 {
        info!("  ... and {} more", files.len() - 3);
    }
}
