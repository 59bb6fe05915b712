//! Stream Input: a small CLI over the remote session core.
//!
//! Resolves a locator against the simulated remote service, logs in (prompting
//! on the terminal unless `--username`/`--password` are given) and pulls audio
//! through the same decoder interface a media player would use.
//!
//! ## Commands
//! - `play`: decode every track, optionally writing raw s16le PCM to a file.
//! - `info`: print track metadata as JSON.
//! - `status`: print the session status snapshot as JSON.
//!
//! Ctrl-C cancels whatever wait is in progress; the process exits with 130.

use anyhow::{Context, Result};
use clap::Parser;
use session_core::{CancelToken, Error};
use stream_input::cli::{Args, Command};
use stream_input::config::{self, PlayConfig, QueryConfig};
use stream_input::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_input=info,session_core=info")
        }))
        .init();

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::info!("interrupted");
            cancel.cancel();
        })
        .context("install Ctrl-C handler")?;
    }

    let session = config::session_config(&args);
    let credentials = config::credentials(&args);
    let outcome = match args.cmd {
        Command::Play {
            locator,
            output,
            track,
            seek,
        } => runtime::run_play(
            PlayConfig {
                locator,
                output,
                track,
                seek,
                credentials,
                session,
            },
            cancel,
        )
        .and_then(|summary| print_json(&summary)),
        Command::Info { locator } => runtime::run_info(
            QueryConfig {
                locator: Some(locator),
                credentials,
                session,
            },
            cancel,
        )
        .and_then(|tracks| print_json(&tracks)),
        Command::Status { locator } => runtime::run_status(
            QueryConfig {
                locator,
                credentials,
                session,
            },
            cancel,
        )
        .and_then(|status| print_json(&status)),
    };

    if let Err(err) = &outcome {
        if err.downcast_ref::<Error>() == Some(&Error::Cancelled) {
            std::process::exit(130);
        }
    }
    outcome
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}
