#![allow(dead_code)] // Not every test file uses every helper

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use ffbatch::config::Config;
use ffbatch::engine::pipeline::AttemptRunner;
use ffbatch::engine::probe::MediaInfo;
use ffbatch::engine::process::AttemptError;
use ffbatch::engine::EncodeCommand;

/// Deterministic stand-in for the encoder subprocess: pops one scripted
/// outcome per invocation and records every command it was asked to run.
/// Successful invocations create the temp output file, like ffmpeg would.
pub struct ScriptedRunner {
    outcomes: Mutex<VecDeque<Result<(), AttemptError>>>,
    invocations: Mutex<Vec<EncodeCommand>>,
    hook: Option<Box<dyn Fn(&EncodeCommand) + Send + Sync>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<Result<(), AttemptError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            invocations: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Runner that succeeds on every invocation.
    pub fn always_ok() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Attach a callback run before each invocation completes (e.g. to
    /// simulate a concurrent writer racing for the output path).
    pub fn with_hook(mut self, hook: impl Fn(&EncodeCommand) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn invocations(&self) -> Vec<EncodeCommand> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl AttemptRunner for ScriptedRunner {
    fn run(&self, cmd: &EncodeCommand, _timeout: Duration) -> Result<(), AttemptError> {
        self.invocations.lock().unwrap().push(cmd.clone());
        if let Some(hook) = &self.hook {
            hook(cmd);
        }
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            // An exhausted script defaults to success, like always_ok.
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            fs::write(&cmd.output, b"encoded").expect("scripted runner writes temp output");
        }
        outcome
    }
}

/// Config pointed at temp roots, with the size gate disabled so tiny
/// fixtures flow through the pipeline.
pub fn test_config(input_root: &Path, output_root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.input = input_root.to_path_buf();
    cfg.paths.output = output_root.to_path_buf();
    cfg.files.min_size_mb = 0;
    cfg
}

/// The S1 source: 1080p h264 at 10 Mbps, two minutes long.
pub fn meta_1080p_h264() -> MediaInfo {
    MediaInfo {
        source_codec: "h264".to_string(),
        width: 1920,
        height: 1080,
        duration_s: 120.0,
        fps: 30.0,
        video_bitrate_bps: 10_000_000,
        audio_bitrate_bps: None,
    }
}

/// A wmv3 source, which only QSV can hardware-decode.
pub fn meta_wmv3() -> MediaInfo {
    MediaInfo {
        source_codec: "wmv3".to_string(),
        width: 1280,
        height: 720,
        duration_s: 60.0,
        fps: 25.0,
        video_bitrate_bps: 4_000_000,
        audio_bitrate_bps: None,
    }
}

pub fn write_input(input_root: &Path, rel: &str) -> std::path::PathBuf {
    let path = input_root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, b"fake video payload").unwrap();
    path
}
