use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "stream-input", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Audio queue capacity in segments
    #[arg(long, default_value_t = 255)]
    pub queue_capacity: usize,

    /// Queue slots reserved for end-of-track markers
    #[arg(long, default_value_t = 5)]
    pub queue_headroom: usize,

    /// How often a pending login re-checks state and Ctrl-C (milliseconds)
    #[arg(long, default_value_t = 100)]
    pub login_poll_ms: u64,

    /// How often a blocked decode re-checks Ctrl-C (milliseconds)
    #[arg(long, default_value_t = 100)]
    pub take_poll_ms: u64,

    /// Account name; skips the interactive prompt when given with --password
    #[arg(long)]
    pub username: Option<String>,

    /// Account password
    #[arg(long, requires = "username")]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode every track behind a locator
    Play {
        /// Album, playlist, search or track locator
        locator: String,

        /// Write raw s16le PCM here instead of discarding it
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only decode this track (0-based)
        #[arg(long)]
        track: Option<usize>,

        /// Start each track at this offset in seconds
        #[arg(long)]
        seek: Option<f64>,
    },

    /// Print metadata for every track behind a locator
    Info {
        locator: String,
    },

    /// Print the session status as JSON, optionally after opening a locator
    Status {
        locator: Option<String>,
    },
}
