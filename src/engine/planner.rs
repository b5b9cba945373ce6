// Target bitrate planning

use crate::config::BitrateConfig;

use super::probe::MediaInfo;

/// Built-in caps keyed by the short side of the frame. Config's
/// `max_by_resolution` table replaces this wholesale when present.
const TIER_CAPS: [(u32, u64); 3] = [(720, 1_500_000), (1080, 3_000_000), (1440, 5_000_000)];

/// Cap for anything above the last tier (4K and up).
const TOP_CAP: u64 = 9_000_000;

/// Derive the video bitrate the encoder will be told to hit.
///
/// A forced value short-circuits everything. Otherwise the source bitrate is
/// scaled by the configured ratio and clamped between the floor and the
/// resolution tier cap.
pub fn plan_target_bitrate(meta: &MediaInfo, cfg: &BitrateConfig) -> u64 {
    if cfg.forced > 0 {
        return cfg.forced;
    }

    let candidate = (meta.video_bitrate_bps as f64 * cfg.ratio) as u64;
    let cap = tier_cap(meta.short_side(), cfg.resolution_caps().as_deref());

    // A floor above the cap means the config contradicts itself; the cap wins
    // so small screens never get giant files.
    candidate.clamp(cfg.min.min(cap), cap)
}

fn tier_cap(short_side: u32, overrides: Option<&[(u32, u64)]>) -> u64 {
    let table: &[(u32, u64)] = overrides.unwrap_or(&TIER_CAPS);
    for &(side, cap) in table {
        if short_side <= side {
            return cap;
        }
    }
    match overrides {
        // Above the last override tier, the largest configured cap applies.
        Some(caps) => caps.iter().map(|&(_, cap)| cap).max().unwrap_or(TOP_CAP),
        None => TOP_CAP,
    }
}
