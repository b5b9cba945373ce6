// Startup detection of usable hardware encoders

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EncodersConfig;

use super::command::{Codec, Encoder, FFMPEG_BIN, encoder_tag};
use super::process::wait_with_deadline;

/// A detection encode of one synthetic frame should be near-instant; anything
/// slower means the driver is wedged and the encoder is unusable anyway.
const DETECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Read-only result of startup detection, consumed by the scheduler and the
/// attempt planner.
#[derive(Debug, Clone, Default)]
pub struct DetectedEncoders {
    available: Vec<Encoder>,
    reasons: BTreeMap<Encoder, String>,
}

impl DetectedEncoders {
    pub fn is_available(&self, encoder: Encoder) -> bool {
        self.available.contains(&encoder)
    }

    /// Available hardware encoders in fallback priority order.
    pub fn hardware(&self) -> impl Iterator<Item = Encoder> + '_ {
        self.available.iter().copied().filter(Encoder::is_hardware)
    }

    pub fn cpu_available(&self) -> bool {
        self.is_available(Encoder::Cpu)
    }

    pub fn available(&self) -> &[Encoder] {
        &self.available
    }

    /// Why an encoder was ruled out, for the `check-encoders` report.
    pub fn reason(&self, encoder: Encoder) -> Option<&str> {
        self.reasons.get(&encoder).map(String::as_str)
    }

    /// Build a detection result from a known-available list, bypassing the
    /// probes. Used when the caller already knows the host (and by tests).
    pub fn from_available(available: Vec<Encoder>) -> Self {
        Self {
            available,
            reasons: BTreeMap::new(),
        }
    }
}

/// Probe which encoders actually work on this host. Config-disabled encoders
/// are not probed; probe failures disable the encoder for the whole run.
pub fn detect(cfg: &EncodersConfig, codec: Codec) -> DetectedEncoders {
    let mut detected = DetectedEncoders::default();

    for encoder in Encoder::ALL {
        let pool = cfg.pool(encoder);
        if !pool.enabled {
            detected
                .reasons
                .insert(encoder, "disabled in config".to_string());
            continue;
        }

        match try_encoder(encoder, codec) {
            Ok(()) => {
                info!("encoder available: {}", encoder.display_name());
                detected.available.push(encoder);
            }
            Err(reason) => {
                warn!("encoder unavailable: {} ({reason})", encoder.display_name());
                detected.reasons.insert(encoder, reason);
            }
        }
    }

    detected
}

fn try_encoder(encoder: Encoder, codec: Codec) -> Result<(), String> {
    // The CPU compat fallback re-encodes to AVC, so for the CPU pool it is
    // enough that *some* software tag exists; hardware pools must support the
    // requested codec or every one of their attempts would be skipped.
    let tag = match encoder_tag(encoder, codec) {
        Some(tag) => tag,
        None if encoder == Encoder::Cpu => encoder_tag(Encoder::Cpu, Codec::Avc)
            .ok_or_else(|| "no software encoder tag".to_string())?,
        None => return Err(format!("no {codec} support")),
    };
    null_encode(tag)
}

/// One-frame synthetic encode to /dev/null territory. The only reliable way
/// to find out whether a driver actually works, short of trusting
/// `-encoders` output that lists encoders the hardware cannot run.
fn null_encode(tag: &str) -> Result<(), String> {
    let mut child = Command::new(FFMPEG_BIN)
        .args([
            "-hide_banner",
            "-f",
            "lavfi",
            "-i",
            "nullsrc=s=256x256:d=1",
            "-frames:v",
            "1",
            "-c:v",
            tag,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("cannot run {FFMPEG_BIN}: {e}"))?;

    match wait_with_deadline(&mut child, DETECT_TIMEOUT) {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(format!("test encode with {tag} failed ({status})")),
        Ok(None) => {
            child.kill().ok();
            child.wait().ok();
            Err(format!("test encode with {tag} hung"))
        }
        Err(e) => Err(format!("wait failed: {e}")),
    }
}

/// `ffmpeg -version`, for the preflight report.
pub fn ffmpeg_version() -> Option<String> {
    let output = Command::new(FFMPEG_BIN)
        .arg("-version")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(|l| l.to_string())
}

/// Log the detection outcome for every encoder, available or not.
pub fn log_report(cfg: &EncodersConfig, detected: &DetectedEncoders) {
    for encoder in Encoder::ALL {
        if detected.is_available(encoder) {
            info!(
                "  {:<20} available (max {} concurrent)",
                encoder.display_name(),
                cfg.pool(encoder).max_concurrent
            );
        } else {
            let reason = detected.reason(encoder).unwrap_or("not probed");
            info!("  {:<20} unavailable: {reason}", encoder.display_name());
        }
    }
    debug!("detection complete: {:?}", detected.available());
}
