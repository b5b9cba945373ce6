use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ffbatch::engine::command::Codec;

#[derive(Parser)]
#[command(name = "ffbatch")]
#[command(about = "Batch video transcoder with hardware-encoder fallback", long_about = None)]
pub struct Cli {
    /// Config file (default: ./ffbatch.toml, then the user config dir)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Input directory to scan for video files
    #[arg(short, long, value_name = "DIR")]
    pub input: Option<PathBuf>,

    /// Output directory for transcoded files
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Output codec (hevc, avc, av1)
    #[arg(long)]
    pub codec: Option<Codec>,

    /// Force this exact video bitrate (bps) instead of computing one
    #[arg(long, value_name = "BPS")]
    pub force_bitrate: Option<u64>,

    /// Frame-rate cap for fps-limited attempts
    #[arg(long, value_name = "FPS")]
    pub max_fps: Option<u32>,

    /// Skip inputs smaller than this (MB)
    #[arg(long, value_name = "MB")]
    pub min_size: Option<u64>,

    /// Flatten the output tree instead of mirroring the input layout
    #[arg(long)]
    pub no_keep_structure: bool,

    /// Re-encode files whose output already exists
    #[arg(long)]
    pub overwrite: bool,

    /// Global cap on concurrent encoder processes
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Enumerate the work and exit without encoding
    #[arg(long)]
    pub dry_run: bool,

    /// Log the full ffmpeg command for every attempt
    #[arg(long)]
    pub print_cmd: bool,

    /// More logging (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Less logging (-q: warnings only, -qq: errors only)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe which hardware encoders actually work on this host
    CheckEncoders,

    /// Probe a video file and print its metadata
    Probe {
        /// Path to the video file
        file: PathBuf,
    },

    /// Create a default config file in the user config dir
    InitConfig,
}

pub fn parse() -> Cli {
    Cli::parse()
}
