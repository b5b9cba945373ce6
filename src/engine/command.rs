// Encoder tables and ffmpeg command construction

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{AudioConfig, AudioMode, FpsConfig};

/// Name of the transcoder binary looked up on PATH.
pub const FFMPEG_BIN: &str = "ffmpeg";

/// SVT-AV1 takes numeric presets, not the x264-style speed names.
const SVT_AV1_PRESET: &str = "8";

/// Pre-input flags that tell ffmpeg to keep going over damaged packets.
const TOLERANCE_FLAGS: [&str; 4] = ["-fflags", "+discardcorrupt", "-err_detect", "ignore_err"];

/// Suffix appended to an attempt label once tolerance flags are injected.
pub const TOLERANT_LABEL_SUFFIX: &str = " + tolerant decode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    Nvenc,
    Qsv,
    Videotoolbox,
    Cpu,
}

impl Encoder {
    /// Hardware encoders in fallback priority order. The scheduler and the
    /// attempt planner both iterate this; do not reorder casually.
    pub const HARDWARE: [Encoder; 3] = [Encoder::Nvenc, Encoder::Qsv, Encoder::Videotoolbox];

    pub const ALL: [Encoder; 4] = [
        Encoder::Nvenc,
        Encoder::Qsv,
        Encoder::Videotoolbox,
        Encoder::Cpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoder::Nvenc => "nvenc",
            Encoder::Qsv => "qsv",
            Encoder::Videotoolbox => "videotoolbox",
            Encoder::Cpu => "cpu",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Encoder::Nvenc => "NVIDIA NVENC",
            Encoder::Qsv => "Intel QSV",
            Encoder::Videotoolbox => "Apple VideoToolbox",
            Encoder::Cpu => "CPU",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Encoder::Cpu)
    }
}

impl std::fmt::Display for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    HwDecode,
    SwDecodeLimited,
    SwDecode,
}

impl DecodeMode {
    pub fn label(&self) -> &'static str {
        match self {
            DecodeMode::HwDecode => "hw-decode",
            DecodeMode::SwDecodeLimited => "sw-decode (fps-capped)",
            DecodeMode::SwDecode => "sw-decode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Hevc,
    Avc,
    Av1,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Hevc => "hevc",
            Codec::Avc => "avc",
            Codec::Av1 => "av1",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hevc" | "h265" => Ok(Codec::Hevc),
            "avc" | "h264" => Ok(Codec::Avc),
            "av1" => Ok(Codec::Av1),
            other => Err(format!("unknown codec '{other}' (expected hevc, avc or av1)")),
        }
    }
}

/// ffmpeg encoder tag for an (encoder, output codec) pair. `None` means the
/// encoder cannot produce that codec and the attempt must be skipped.
pub fn encoder_tag(encoder: Encoder, codec: Codec) -> Option<&'static str> {
    match (encoder, codec) {
        (Encoder::Nvenc, Codec::Hevc) => Some("hevc_nvenc"),
        (Encoder::Nvenc, Codec::Avc) => Some("h264_nvenc"),
        (Encoder::Nvenc, Codec::Av1) => Some("av1_nvenc"),
        (Encoder::Qsv, Codec::Hevc) => Some("hevc_qsv"),
        (Encoder::Qsv, Codec::Avc) => Some("h264_qsv"),
        (Encoder::Qsv, Codec::Av1) => Some("av1_qsv"),
        (Encoder::Videotoolbox, Codec::Hevc) => Some("hevc_videotoolbox"),
        (Encoder::Videotoolbox, Codec::Avc) => Some("h264_videotoolbox"),
        (Encoder::Videotoolbox, Codec::Av1) => None,
        (Encoder::Cpu, Codec::Hevc) => Some("libx265"),
        (Encoder::Cpu, Codec::Avc) => Some("libx264"),
        (Encoder::Cpu, Codec::Av1) => Some("libsvtav1"),
    }
}

/// Source codecs each accelerator's hardware decoder accepts. These lists are
/// the compatibility-critical data of the whole tool: a codec missing here
/// silently costs a hardware decode, a codec wrongly present crashes the
/// attempt at runtime. Verified against ffmpeg's cuvid/qsv/videotoolbox
/// decoder lists; QSV is the only one that takes VC-1/WMV3.
pub fn hw_decode_whitelist(encoder: Encoder) -> &'static [&'static str] {
    match encoder {
        Encoder::Nvenc => &[
            "h264",
            "hevc",
            "mpeg1video",
            "mpeg2video",
            "mpeg4",
            "vp8",
            "vp9",
            "av1",
        ],
        Encoder::Qsv => &[
            "h264",
            "hevc",
            "mpeg2video",
            "vp8",
            "vp9",
            "av1",
            "vc1",
            "wmv3",
        ],
        Encoder::Videotoolbox => &["h264", "hevc", "mpeg2video", "mpeg4", "prores"],
        Encoder::Cpu => &[],
    }
}

/// `-hwaccel` selector and optional `-hwaccel_output_format` per encoder.
fn hwaccel_args(encoder: Encoder) -> Option<(&'static str, Option<&'static str>)> {
    match encoder {
        Encoder::Nvenc => Some(("cuda", Some("cuda"))),
        Encoder::Qsv => Some(("qsv", Some("qsv"))),
        Encoder::Videotoolbox => Some(("videotoolbox", None)),
        Encoder::Cpu => None,
    }
}

/// One planned invocation: which encoder, how to decode, which output codec.
/// The codec is normally the configured one; the final CPU compatibility step
/// downgrades it to AVC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptSpec {
    pub encoder: Encoder,
    pub decode_mode: DecodeMode,
    pub codec: Codec,
}

impl AttemptSpec {
    pub fn label(&self) -> String {
        format!("{} {}", self.encoder.display_name(), self.decode_mode.label())
    }
}

/// A transcoder invocation as named sections. Flattened to a flat argv only
/// at spawn time, so retry transformations (tolerance flags, audio rebuild)
/// stay structural instead of splicing strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeCommand {
    pub global: Vec<String>,
    pub preinput: Vec<String>,
    pub input: PathBuf,
    pub filters: Vec<String>,
    pub video: Vec<String>,
    pub audio: Vec<String>,
    pub subtitle: Vec<String>,
    pub output: PathBuf,
    /// Human-readable method name, e.g. "NVIDIA NVENC hw-decode". Annotated
    /// when tolerance flags are injected; surfaced in logs and retry history.
    pub label: String,
}

impl EncodeCommand {
    /// Arguments passed to the transcoder binary, in invocation order.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        argv.extend(self.global.iter().cloned());
        argv.extend(self.preinput.iter().cloned());
        argv.push("-i".into());
        argv.push(self.input.to_string_lossy().into_owned());
        argv.extend(self.filters.iter().cloned());
        argv.extend(self.video.iter().cloned());
        argv.extend(self.audio.iter().cloned());
        argv.extend(self.subtitle.iter().cloned());
        argv.push(self.output.to_string_lossy().into_owned());
        argv
    }

    pub fn has_tolerance_flags(&self) -> bool {
        self.preinput.iter().any(|a| a == "+discardcorrupt")
    }

    /// Copy of this command with corruption-tolerance flags ahead of `-i`.
    /// Applying it twice yields the same command.
    pub fn with_tolerance_flags(&self) -> EncodeCommand {
        if self.has_tolerance_flags() {
            return self.clone();
        }
        let mut cmd = self.clone();
        cmd.preinput.extend(TOLERANCE_FLAGS.iter().map(|s| s.to_string()));
        cmd.label.push_str(TOLERANT_LABEL_SUFFIX);
        cmd
    }

    /// Shell-quoted rendering for logs and `--print-cmd`.
    pub fn rendered(&self) -> String {
        let argv = self.to_argv();
        let mut parts = vec![FFMPEG_BIN.to_string()];
        parts.extend(argv);
        shlex::try_join(parts.iter().map(|s| s.as_str())).unwrap_or_else(|_| parts.join(" "))
    }
}

/// Build the argv for one attempt. Returns `None` iff the encoder has no tag
/// for the requested output codec.
pub fn build_command(
    spec: &AttemptSpec,
    input: &Path,
    temp_output: &Path,
    target_bps: u64,
    fps: &FpsConfig,
    cpu_preset: &str,
    audio_args: &[String],
) -> Option<EncodeCommand> {
    let tag = encoder_tag(spec.encoder, spec.codec)?;

    let mut preinput = Vec::new();
    if spec.decode_mode == DecodeMode::HwDecode {
        if let Some((accel, output_format)) = hwaccel_args(spec.encoder) {
            preinput.push("-hwaccel".into());
            preinput.push(accel.into());
            if let Some(fmt) = output_format {
                preinput.push("-hwaccel_output_format".into());
                preinput.push(fmt.into());
            }
        }
    }

    // fps cap applies only to the capped software-decode rung, and each
    // encoder class has its own policy switch.
    let limit_fps = spec.decode_mode == DecodeMode::SwDecodeLimited
        && if spec.encoder.is_hardware() {
            fps.limit_on_software_decode
        } else {
            fps.limit_on_software_encode
        };
    let mut filters = Vec::new();
    if limit_fps {
        filters.push("-vf".into());
        filters.push(format!("fps={}", fps.max));
    }

    let mut video = vec!["-c:v".into(), tag.into(), "-b:v".into(), target_bps.to_string()];
    if spec.encoder == Encoder::Cpu {
        video.push("-preset".into());
        if spec.codec == Codec::Av1 {
            video.push(SVT_AV1_PRESET.into());
        } else {
            video.push(cpu_preset.into());
        }
    }

    let mut label = spec.label();
    if limit_fps {
        label.push_str(&format!(" fps<={}", fps.max));
    }

    Some(EncodeCommand {
        global: vec!["-y".into(), "-hide_banner".into()],
        preinput,
        input: input.to_path_buf(),
        filters,
        video,
        audio: audio_args.to_vec(),
        subtitle: vec!["-sn".into()],
        output: temp_output.to_path_buf(),
        label,
    })
}

/// Parse "128k" / "1M" / "64000" into bps.
pub fn parse_bitrate_to_bps(value: &str) -> Option<u64> {
    let v = value.trim().to_ascii_lowercase();
    if v.is_empty() || v == "null" {
        return None;
    }
    let stripped = v.strip_suffix("bps").unwrap_or(&v);
    if let Some(n) = stripped.strip_suffix('k') {
        return n.trim().parse::<f64>().ok().map(|n| (n * 1_000.0) as u64);
    }
    if let Some(n) = stripped.strip_suffix('m') {
        return n.trim().parse::<f64>().ok().map(|n| (n * 1_000_000.0) as u64);
    }
    stripped.parse::<u64>().ok()
}

/// Audio argv for the first run plus the rebuild used if that run fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPlan {
    pub args: Vec<String>,
    /// Set when copy was tried first (mode `auto`, or a smart downgrade);
    /// the pipeline re-runs once with these on failure.
    pub retry_args: Option<Vec<String>>,
}

fn audio_args_for(cfg: &AudioConfig, mode: AudioMode) -> Vec<String> {
    match mode {
        AudioMode::Off => vec!["-an".into()],
        AudioMode::Copy | AudioMode::Auto => vec!["-c:a".into(), "copy".into()],
        AudioMode::Transcode => {
            let mut args = vec!["-c:a".into(), cfg.codec.clone()];
            if !cfg.bitrate.trim().is_empty() {
                args.push("-b:a".into());
                args.push(cfg.bitrate.clone());
            }
            args
        }
    }
}

/// Resolve the audio strategy for one task.
///
/// `transcode` silently downgrades to copy when the probed source bitrate is
/// already at or below the target, keeping the transcode argv as the retry
/// plan; `auto` always runs copy first with transcode as the retry plan.
pub fn plan_audio(cfg: &AudioConfig, source_audio_bps: Option<u64>) -> AudioPlan {
    match cfg.mode {
        AudioMode::Off | AudioMode::Copy => AudioPlan {
            args: audio_args_for(cfg, cfg.mode),
            retry_args: None,
        },
        AudioMode::Auto => AudioPlan {
            args: audio_args_for(cfg, AudioMode::Copy),
            retry_args: Some(audio_args_for(cfg, AudioMode::Transcode)),
        },
        AudioMode::Transcode => {
            let transcode = audio_args_for(cfg, AudioMode::Transcode);
            let target = parse_bitrate_to_bps(&cfg.bitrate);
            match (source_audio_bps, target) {
                (Some(source), Some(target)) if source <= target => AudioPlan {
                    args: audio_args_for(cfg, AudioMode::Copy),
                    retry_args: Some(transcode),
                },
                _ => AudioPlan {
                    args: transcode,
                    retry_args: None,
                },
            }
        }
    }
}
