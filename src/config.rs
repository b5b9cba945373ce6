// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::command::{Codec, Encoder};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub files: FilesConfig,

    #[serde(default)]
    pub encoding: EncodingConfig,

    #[serde(default)]
    pub fps: FpsConfig,

    #[serde(default)]
    pub encoders: EncodersConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub error_recovery: ErrorRecoveryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Enumerate the work and exit without spawning anything.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_input_dir")]
    pub input: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output: PathBuf,

    /// Directory for run logs; no file logging when unset.
    #[serde(default)]
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Inputs smaller than this are skipped without probing.
    #[serde(default = "default_min_size_mb")]
    pub min_size_mb: u64,

    /// Skip (true) or overwrite (false) when the output already exists.
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Mirror the input tree under the output root, or flatten to one dir.
    #[serde(default = "default_true")]
    pub keep_structure: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodingConfig {
    #[serde(default)]
    pub codec: Codec,

    #[serde(default)]
    pub bitrate: BitrateConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateConfig {
    /// If > 0, used verbatim as the target (bps); the planner is bypassed.
    #[serde(default)]
    pub forced: u64,

    /// Multiplier on the source bitrate when computing a target.
    #[serde(default = "default_bitrate_ratio")]
    pub ratio: f64,

    /// Floor (bps) for computed targets.
    #[serde(default = "default_bitrate_min")]
    pub min: u64,

    /// Optional override of the built-in resolution cap table. Keys are the
    /// short-side pixel count ("720", "1080", ...), values bps.
    #[serde(default)]
    pub max_by_resolution: Option<BTreeMap<String, u64>>,
}

impl BitrateConfig {
    /// The override table as sorted (short_side, cap) pairs. Keys that do not
    /// parse as a pixel count are dropped.
    pub fn resolution_caps(&self) -> Option<Vec<(u32, u64)>> {
        let table = self.max_by_resolution.as_ref()?;
        let mut caps: Vec<(u32, u64)> = table
            .iter()
            .filter_map(|(k, v)| k.trim().parse::<u32>().ok().map(|side| (side, *v)))
            .collect();
        if caps.is_empty() {
            return None;
        }
        caps.sort_unstable();
        Some(caps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Off,
    Copy,
    #[default]
    Transcode,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub mode: AudioMode,

    /// Codec and bitrate used when transcoding audio.
    #[serde(default = "default_audio_codec")]
    pub codec: String,

    #[serde(default = "default_audio_bitrate")]
    pub bitrate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FpsConfig {
    #[serde(default = "default_max_fps")]
    pub max: u32,

    /// Apply the fps cap on software-decode attempts of hardware encoders.
    #[serde(default = "default_true")]
    pub limit_on_software_decode: bool,

    /// Apply the fps cap on CPU encode attempts.
    #[serde(default = "default_true")]
    pub limit_on_software_encode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderPoolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_pool_concurrency")]
    pub max_concurrent: usize,

    /// Encoder speed preset; only meaningful for the CPU pool today.
    #[serde(default)]
    pub preset: Option<String>,
}

impl Default for EncoderPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_pool_concurrency(),
            preset: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodersConfig {
    #[serde(default)]
    pub nvenc: EncoderPoolConfig,

    #[serde(default)]
    pub qsv: EncoderPoolConfig,

    #[serde(default)]
    pub videotoolbox: EncoderPoolConfig,

    #[serde(default)]
    pub cpu: EncoderPoolConfig,
}

impl EncodersConfig {
    pub fn pool(&self, encoder: Encoder) -> &EncoderPoolConfig {
        match encoder {
            Encoder::Nvenc => &self.nvenc,
            Encoder::Qsv => &self.qsv,
            Encoder::Videotoolbox => &self.videotoolbox,
            Encoder::Cpu => &self.cpu,
        }
    }

    pub fn cpu_preset(&self) -> &str {
        self.cpu.preset.as_deref().unwrap_or("medium")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Hard cap on encoder subprocesses across all pools.
    #[serde(default = "default_max_total_concurrent")]
    pub max_total_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecoveryConfig {
    /// Retry an attempt with corruption-tolerance flags when the decoder
    /// reports damaged input.
    #[serde(default = "default_true")]
    pub retry_decode_errors_with_ignore: bool,

    /// Tolerance retries allowed per attempt.
    #[serde(default = "default_ignore_retries")]
    pub max_ignore_retries_per_method: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Console level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log the full ffmpeg argv for every attempt at INFO.
    #[serde(default)]
    pub print_cmd: bool,

    /// Emit the n/total progress line after each finished task.
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_min_size_mb() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_bitrate_ratio() -> f64 {
    0.5
}

fn default_bitrate_min() -> u64 {
    500_000
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_max_fps() -> u32 {
    30
}

fn default_pool_concurrency() -> usize {
    2
}

fn default_max_total_concurrent() -> usize {
    5
}

fn default_ignore_retries() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input: default_input_dir(),
            output: default_output_dir(),
            log: None,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            min_size_mb: default_min_size_mb(),
            skip_existing: true,
            keep_structure: true,
        }
    }
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            forced: 0,
            ratio: default_bitrate_ratio(),
            min: default_bitrate_min(),
            max_by_resolution: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::default(),
            codec: default_audio_codec(),
            bitrate: default_audio_bitrate(),
        }
    }
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self {
            max: default_max_fps(),
            limit_on_software_decode: true,
            limit_on_software_encode: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_total_concurrent: default_max_total_concurrent(),
        }
    }
}

impl Default for ErrorRecoveryConfig {
    fn default() -> Self {
        Self {
            retry_decode_errors_with_ignore: true,
            max_ignore_retries_per_method: default_ignore_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            print_cmd: false,
            show_progress: true,
        }
    }
}

impl Config {
    /// Config search order: `./ffbatch.toml`, then the user config dir.
    pub fn default_config_path() -> Option<PathBuf> {
        let local = PathBuf::from("ffbatch.toml");
        if local.exists() {
            return Some(local);
        }
        let user = dirs::config_dir()?.join("ffbatch").join("config.toml");
        user.exists().then_some(user)
    }

    /// Load from an explicit path, or from the search order, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_config_path(),
        };

        let Some(path) = path else {
            return Ok(Config::default());
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the built-in defaults to the user config dir if absent.
    pub fn ensure_default() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ffbatch");
        let path = dir.join("config.toml");
        if !path.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
            let contents =
                toml::to_string_pretty(&Config::default()).context("Failed to serialize config")?;
            fs::write(&path, contents)
                .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        }
        Ok(path)
    }

    /// Range checks on everything a typo can break. Returns every problem at
    /// once so users fix the file in one pass.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, pool) in [
            ("nvenc", &self.encoders.nvenc),
            ("qsv", &self.encoders.qsv),
            ("videotoolbox", &self.encoders.videotoolbox),
            ("cpu", &self.encoders.cpu),
        ] {
            if pool.max_concurrent == 0 || pool.max_concurrent > 100 {
                errors.push(format!(
                    "encoders.{name}.max_concurrent must be between 1 and 100"
                ));
            }
        }

        let total = self.scheduler.max_total_concurrent;
        if total == 0 || total > 100 {
            errors.push("scheduler.max_total_concurrent must be between 1 and 100".to_string());
        }

        if self.fps.max == 0 || self.fps.max > 240 {
            errors.push("fps.max must be between 1 and 240".to_string());
        }

        if !(0.0..=1.0).contains(&self.encoding.bitrate.ratio) {
            errors.push("encoding.bitrate.ratio must be between 0.0 and 1.0".to_string());
        }

        if let Some(table) = &self.encoding.bitrate.max_by_resolution {
            for key in table.keys() {
                if key.trim().parse::<u32>().is_err() {
                    errors.push(format!(
                        "encoding.bitrate.max_by_resolution key '{key}' is not a pixel count"
                    ));
                }
            }
        }

        errors
    }
}
