// Input probing using ffprobe

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, warn};

use super::process::wait_with_deadline;

/// Name of the probe binary looked up on PATH.
pub const FFPROBE_BIN: &str = "ffprobe";

/// A stuck probe must not stall the whole batch.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized source metadata. Every field has a sentinel default so planning
/// never sees raw, partially-decoded probe output.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub source_codec: String,
    pub width: u32,
    pub height: u32,
    pub duration_s: f64,
    pub fps: f64,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: Option<u64>,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            source_codec: "unknown".to_string(),
            width: 1920,
            height: 1080,
            duration_s: 0.0,
            fps: 30.0,
            video_bitrate_bps: 3_000_000,
            audio_bitrate_bps: None,
        }
    }
}

impl MediaInfo {
    pub fn short_side(&self) -> u32 {
        self.width.min(self.height)
    }
}

// ffprobe's JSON shape; numbers arrive as strings.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    bit_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

/// Probe a file with a single ffprobe call. Never fails: any error path logs
/// a warning and returns the sentinel defaults so the task still encodes.
pub fn probe(path: &Path) -> MediaInfo {
    match run_ffprobe(path).and_then(|json| parse_metadata(&json)) {
        Ok(info) => {
            debug!(file = %path.display(), ?info, "probe ok");
            info
        }
        Err(e) => {
            warn!(file = %path.display(), "probe failed, using defaults: {e:#}");
            MediaInfo::default()
        }
    }
}

fn run_ffprobe(path: &Path) -> Result<String> {
    let mut child = Command::new(FFPROBE_BIN)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=bit_rate,duration:stream=codec_name,codec_type,width,height,r_frame_rate,bit_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to run ffprobe")?;

    let status = match wait_with_deadline(&mut child, PROBE_TIMEOUT)? {
        Some(status) => status,
        None => {
            child.kill().ok();
            child.wait().ok();
            bail!("ffprobe timed out after {}s", PROBE_TIMEOUT.as_secs());
        }
    };

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        use std::io::Read;
        out.read_to_string(&mut stdout).ok();
    }

    if !status.success() {
        bail!("ffprobe exited with {status}");
    }
    Ok(stdout)
}

/// Map the probe JSON to a closed struct; video stream 0 and audio stream 0
/// only. Missing or malformed fields fall back to the sentinels.
pub fn parse_metadata(json: &str) -> Result<MediaInfo> {
    let parsed: ProbeOutput = serde_json::from_str(json).context("malformed ffprobe JSON")?;
    let defaults = MediaInfo::default();

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let fps = video
        .and_then(|s| s.r_frame_rate.as_deref())
        .and_then(parse_fraction)
        .unwrap_or(defaults.fps);

    Ok(MediaInfo {
        source_codec: video
            .and_then(|s| s.codec_name.clone())
            .unwrap_or(defaults.source_codec),
        width: video.and_then(|s| s.width).unwrap_or(defaults.width),
        height: video.and_then(|s| s.height).unwrap_or(defaults.height),
        duration_s: parsed
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(defaults.duration_s),
        fps,
        video_bitrate_bps: parsed
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .unwrap_or(defaults.video_bitrate_bps),
        audio_bitrate_bps: audio
            .and_then(|s| s.bit_rate.as_deref())
            .and_then(|b| b.parse::<u64>().ok()),
    })
}

/// Parse a fraction string like "30000/1001" to f64.
fn parse_fraction(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    s.parse().ok()
}
