// End-to-end pipeline scenarios driven through a scripted encoder

use std::fs;

use tempfile::TempDir;

use ffbatch::config::AudioMode;
use ffbatch::engine::pipeline::{
    TaskContext, TaskFailure, TaskOutcome, run_task_with_probe,
};
use ffbatch::engine::process::{AttemptError, CancelToken};
use ffbatch::engine::{Codec, DecodeMode, DetectedEncoders, Encoder, Scheduler};

use crate::common::helpers::{
    ScriptedRunner, meta_1080p_h264, meta_wmv3, test_config, write_input,
};

struct Fixture {
    _dir: TempDir,
    cfg: ffbatch::config::Config,
    input: std::path::PathBuf,
    output: std::path::PathBuf,
    temp: std::path::PathBuf,
}

fn fixture(input_name: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let input_root = dir.path().join("in");
    let output_root = dir.path().join("out");
    fs::create_dir_all(&input_root).unwrap();
    let input = write_input(&input_root, input_name);
    let cfg = test_config(&input_root, &output_root);

    let stem = std::path::Path::new(input_name).with_extension("mp4");
    let output = output_root.join(&stem);
    let temp_name = format!("tmp_{}", stem.file_name().unwrap().to_string_lossy());
    let temp = output.with_file_name(temp_name);

    Fixture {
        _dir: dir,
        cfg,
        input,
        output,
        temp,
    }
}

fn run(
    fx: &Fixture,
    detected: Vec<Encoder>,
    runner: &ScriptedRunner,
    meta: ffbatch::engine::MediaInfo,
) -> ffbatch::engine::TaskReport {
    let detected = DetectedEncoders::from_available(detected);
    let scheduler = Scheduler::with_pools(
        &fx.cfg.encoders,
        detected.available(),
        fx.cfg.scheduler.max_total_concurrent,
    );
    let cancel = CancelToken::new();
    let ctx = TaskContext {
        cfg: &fx.cfg,
        detected: &detected,
        scheduler: &scheduler,
        runner,
        cancel: &cancel,
    };
    run_task_with_probe(&ctx, &fx.input, |_| meta)
}

#[test]
fn happy_path_single_nvenc_attempt() {
    let fx = fixture("a.mp4");
    let runner = ScriptedRunner::always_ok();
    let report = run(
        &fx,
        vec![Encoder::Nvenc, Encoder::Cpu],
        &runner,
        meta_1080p_h264(),
    );

    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.retry_history.len(), 1);
    assert_eq!(report.retry_history[0].encoder, Encoder::Nvenc);
    assert_eq!(report.retry_history[0].decode_mode, DecodeMode::HwDecode);
    assert_eq!(report.encoder_used, Some(Encoder::Nvenc));
    // 10 Mbps * 0.5 hits the 1080p cap.
    assert_eq!(report.stats.target_bitrate, 3_000_000);
    assert!(fx.output.exists(), "output must be renamed into place");
    assert!(!fx.temp.exists(), "temp must not linger");
    assert_eq!(runner.invocation_count(), 1);
}

#[test]
fn corruption_triggers_one_tolerant_retry_of_same_attempt() {
    let fx = fixture("c.mkv");
    let runner = ScriptedRunner::new(vec![
        Err(AttemptError::DecodeCorruption(
            "Invalid data found when processing input".into(),
        )),
        Ok(()),
    ]);
    let report = run(&fx, vec![Encoder::Nvenc, Encoder::Cpu], &runner, meta_1080p_h264());

    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.retry_history.len(), 1, "same attempt, not a fallback");
    assert!(
        report.retry_history[0].label.contains("tolerant decode"),
        "method label carries the tolerance annotation: {}",
        report.retry_history[0].label
    );

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 2);
    assert!(!invocations[0].has_tolerance_flags());
    assert!(invocations[1].has_tolerance_flags());
    // Flags land ahead of -i.
    let argv = invocations[1].to_argv();
    let i = argv.iter().position(|a| a == "-i").unwrap();
    assert!(argv.iter().position(|a| a == "-fflags").unwrap() < i);
}

#[test]
fn tolerance_retries_are_bounded_per_attempt() {
    let fx = fixture("c.mkv");
    let corrupt = || AttemptError::DecodeCorruption("error while decoding".into());
    // nvenc chain: hw, sw-limited, sw. Every run reports corruption.
    let runner = ScriptedRunner::new(vec![Err(corrupt()); 12]);
    let mut cfg_fx = fx;
    cfg_fx.cfg.error_recovery.max_ignore_retries_per_method = 1;
    let report = run(&cfg_fx, vec![Encoder::Nvenc], &runner, meta_1080p_h264());

    assert!(matches!(
        report.outcome,
        TaskOutcome::Failed(TaskFailure::PlanExhausted(_))
    ));
    // 3 planned attempts, each run twice (base + one tolerant retry).
    assert_eq!(runner.invocation_count(), 6);
    assert_eq!(report.retry_history.len(), 3);
}

#[test]
fn audio_auto_falls_back_to_transcode_once() {
    let mut fx = fixture("d.mkv");
    fx.cfg.encoding.audio.mode = AudioMode::Auto;
    let runner = ScriptedRunner::new(vec![
        Err(AttemptError::Other(
            "Could not write header; incompatible codec".into(),
        )),
        Ok(()),
    ]);
    let report = run(&fx, vec![Encoder::Nvenc, Encoder::Cpu], &runner, meta_1080p_h264());

    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.retry_history.len(), 1);
    assert!(report.retry_history[0].label.contains("audio transcode"));

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 2);
    assert_eq!(
        invocations[0].audio,
        vec!["-c:a".to_string(), "copy".to_string()]
    );
    assert!(invocations[1].audio.contains(&"aac".to_string()));
    assert!(invocations[1].audio.contains(&"-b:a".to_string()));
}

#[test]
fn full_fallback_lands_on_cpu() {
    let fx = fixture("e.mkv");
    // nvenc: hw, sw-limited, sw; qsv: hw, sw-limited, sw; then cpu limited.
    let mut outcomes: Vec<Result<(), AttemptError>> = (0..6)
        .map(|_| Err(AttemptError::MissingEncoder("No NVENC capable devices".into())))
        .collect();
    outcomes.push(Ok(()));
    let runner = ScriptedRunner::new(outcomes);
    let report = run(
        &fx,
        vec![Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu],
        &runner,
        meta_1080p_h264(),
    );

    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.encoder_used, Some(Encoder::Cpu));
    assert_eq!(report.retry_history.len(), 7);

    let attempted: Vec<(Encoder, DecodeMode)> = report
        .retry_history
        .iter()
        .map(|a| (a.encoder, a.decode_mode))
        .collect();
    assert_eq!(
        attempted,
        vec![
            (Encoder::Nvenc, DecodeMode::HwDecode),
            (Encoder::Nvenc, DecodeMode::SwDecodeLimited),
            (Encoder::Nvenc, DecodeMode::SwDecode),
            (Encoder::Qsv, DecodeMode::HwDecode),
            (Encoder::Qsv, DecodeMode::SwDecodeLimited),
            (Encoder::Qsv, DecodeMode::SwDecode),
            (Encoder::Cpu, DecodeMode::SwDecodeLimited),
        ]
    );

    // The winning CPU attempt is fps-capped and software-tagged.
    let last = runner.invocations().last().unwrap().clone();
    assert_eq!(last.filters, vec!["-vf".to_string(), "fps=30".to_string()]);
    assert!(last.video.contains(&"libx265".to_string()));
}

#[test]
fn skip_size_short_circuits_before_probe() {
    let dir = TempDir::new().unwrap();
    let input_root = dir.path().join("in");
    fs::create_dir_all(&input_root).unwrap();
    let input = write_input(&input_root, "tiny.mp4");
    let mut cfg = test_config(&input_root, &dir.path().join("out"));
    cfg.files.min_size_mb = 100;

    let detected = DetectedEncoders::from_available(vec![Encoder::Cpu]);
    let scheduler = Scheduler::with_pools(&cfg.encoders, detected.available(), 2);
    let cancel = CancelToken::new();
    let runner = ScriptedRunner::always_ok();
    let ctx = TaskContext {
        cfg: &cfg,
        detected: &detected,
        scheduler: &scheduler,
        runner: &runner,
        cancel: &cancel,
    };

    let report = run_task_with_probe(&ctx, &input, |_| {
        panic!("a skipped file must not be probed")
    });
    assert_eq!(report.outcome, TaskOutcome::SkipSize);
    assert_eq!(runner.invocation_count(), 0, "no subprocess for skips");
}

#[test]
fn skip_existing_short_circuits() {
    let fx = fixture("f.mp4");
    fs::create_dir_all(fx.output.parent().unwrap()).unwrap();
    fs::write(&fx.output, b"previous run").unwrap();

    let runner = ScriptedRunner::always_ok();
    let report = run(&fx, vec![Encoder::Cpu], &runner, meta_1080p_h264());
    assert_eq!(report.outcome, TaskOutcome::SkipExists);
    assert_eq!(runner.invocation_count(), 0);
    // The pre-existing output is untouched.
    assert_eq!(fs::read(&fx.output).unwrap(), b"previous run");
}

#[test]
fn skip_existing_honored_at_finalize_time() {
    let fx = fixture("g.mp4");
    let final_output = fx.output.clone();
    // Simulate a concurrent producer landing the output mid-encode.
    let runner = ScriptedRunner::always_ok().with_hook(move |_cmd| {
        fs::create_dir_all(final_output.parent().unwrap()).unwrap();
        fs::write(&final_output, b"raced ahead").unwrap();
    });
    let report = run(&fx, vec![Encoder::Cpu], &runner, meta_1080p_h264());

    assert_eq!(report.outcome, TaskOutcome::SkipExists);
    assert_eq!(fs::read(&fx.output).unwrap(), b"raced ahead");
    assert!(!fx.temp.exists(), "losing temp file is cleaned up");
}

#[test]
fn exhausted_plan_fails_and_leaves_no_output() {
    let fx = fixture("h.mp4");
    let runner = ScriptedRunner::new(vec![
        Err(AttemptError::Timeout(300)),
        Err(AttemptError::FormatMismatch("Impossible to convert".into())),
        Err(AttemptError::Other("boom".into())),
        Err(AttemptError::Other("boom".into())),
        Err(AttemptError::Other("boom".into())),
    ]);
    let report = run(&fx, vec![Encoder::Cpu], &runner, meta_1080p_h264());

    match &report.outcome {
        TaskOutcome::Failed(TaskFailure::PlanExhausted(last)) => {
            assert!(matches!(last, AttemptError::Other(_)));
        }
        other => panic!("expected PlanExhausted, got {other:?}"),
    }
    assert!(!fx.output.exists(), "failures must not materialize outputs");
    assert!(!fx.temp.exists());
}

#[test]
fn cancelled_task_runs_nothing() {
    let fx = fixture("i.mp4");
    let detected = DetectedEncoders::from_available(vec![Encoder::Cpu]);
    let scheduler = Scheduler::with_pools(&fx.cfg.encoders, detected.available(), 2);
    let cancel = CancelToken::new();
    cancel.cancel();
    let runner = ScriptedRunner::always_ok();
    let ctx = TaskContext {
        cfg: &fx.cfg,
        detected: &detected,
        scheduler: &scheduler,
        runner: &runner,
        cancel: &cancel,
    };

    let report = run_task_with_probe(&ctx, &fx.input, |_| meta_1080p_h264());
    assert_eq!(report.outcome, TaskOutcome::Cancelled);
    assert_eq!(runner.invocation_count(), 0);
    assert!(!fx.output.exists());
}

#[test]
fn input_outside_root_fails_without_subprocess() {
    let dir = TempDir::new().unwrap();
    let input_root = dir.path().join("in");
    fs::create_dir_all(&input_root).unwrap();
    let outsider = dir.path().join("outsider.mp4");
    fs::write(&outsider, b"fake").unwrap();
    let cfg = test_config(&input_root, &dir.path().join("out"));

    let detected = DetectedEncoders::from_available(vec![Encoder::Cpu]);
    let scheduler = Scheduler::with_pools(&cfg.encoders, detected.available(), 2);
    let cancel = CancelToken::new();
    let runner = ScriptedRunner::always_ok();
    let ctx = TaskContext {
        cfg: &cfg,
        detected: &detected,
        scheduler: &scheduler,
        runner: &runner,
        cancel: &cancel,
    };

    let report = run_task_with_probe(&ctx, &outsider, |_| meta_1080p_h264());
    assert!(matches!(
        report.outcome,
        TaskOutcome::Failed(TaskFailure::PathEscape(_))
    ));
    assert_eq!(runner.invocation_count(), 0);
}

#[test]
fn wmv_source_uses_qsv_hardware_decode_first() {
    let fx = fixture("b.wmv");
    let runner = ScriptedRunner::always_ok();
    let report = run(
        &fx,
        vec![Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu],
        &runner,
        meta_wmv3(),
    );

    // First runnable attempt for wmv3 is nvenc software decode; to check the
    // plan shape end to end, the first executed attempt must NOT be nvenc
    // hw-decode.
    assert_eq!(report.outcome, TaskOutcome::Success);
    let first = &report.retry_history[0];
    assert_eq!(first.encoder, Encoder::Nvenc);
    assert_eq!(first.decode_mode, DecodeMode::SwDecodeLimited);
}

#[test]
fn attempted_sequence_is_prefix_of_plan() {
    use ffbatch::engine::build_attempt_plan;

    let fx = fixture("j.mkv");
    let runner = ScriptedRunner::new(vec![
        Err(AttemptError::Other("fail 1".into())),
        Err(AttemptError::Other("fail 2".into())),
        Ok(()),
    ]);
    let detected_list = vec![Encoder::Nvenc, Encoder::Qsv, Encoder::Cpu];
    let report = run(&fx, detected_list.clone(), &runner, meta_1080p_h264());

    let detected = DetectedEncoders::from_available(detected_list);
    let plan = build_attempt_plan(&detected, "h264", Codec::Hevc);
    assert!(report.retry_history.len() <= plan.len());
    for (record, spec) in report.retry_history.iter().zip(plan.iter()) {
        assert_eq!(record.encoder, spec.encoder);
        assert_eq!(record.decode_mode, spec.decode_mode);
    }
}

#[test]
fn scheduler_counters_reflect_attempt_outcomes() {
    let fx = fixture("k.mkv");
    let runner = ScriptedRunner::new(vec![
        Err(AttemptError::Other("fail".into())),
        Ok(()),
    ]);
    let detected = DetectedEncoders::from_available(vec![Encoder::Nvenc, Encoder::Cpu]);
    let scheduler = Scheduler::with_pools(&fx.cfg.encoders, detected.available(), 4);
    let cancel = CancelToken::new();
    let ctx = TaskContext {
        cfg: &fx.cfg,
        detected: &detected,
        scheduler: &scheduler,
        runner: &runner,
        cancel: &cancel,
    };
    let report = run_task_with_probe(&ctx, &fx.input, |_| meta_1080p_h264());
    assert_eq!(report.outcome, TaskOutcome::Success);

    let snap = scheduler.stats();
    assert_eq!(snap.slots[&Encoder::Nvenc].failed, 1);
    assert_eq!(snap.slots[&Encoder::Nvenc].completed, 1);
    assert_eq!(snap.total_in_flight, 0);
}
