//! Command implementations.
//!
//! Every command runs its session work on a worker thread while the calling
//! thread services the UI task queue, so the credential prompt always appears
//! on the thread that owns the terminal.

use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use session_core::prompt::{
    CredentialPrompt, Credentials, MainThread, MainThreadHandle, MainThreadQueue, PromptOutcome,
};
use session_core::sim::{SimCatalog, SimRemote};
use session_core::{AudioFrames, CancelToken, RemoteInput, SessionConfig, SessionCoordinator};
use stream_input_types::{SessionStatus, StreamFormat, TrackInfo};

use crate::config::{PlayConfig, QueryConfig};

pub const DEMO_USERNAME: &str = "demo";
pub const DEMO_PASSWORD: &str = "demo";

const UI_POLL: Duration = Duration::from_millis(50);

/// Outcome of a `play` run.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PlaySummary {
    pub locator: String,
    pub tracks_played: usize,
    pub frames: u64,
    pub bytes_written: u64,
    pub format: Option<StreamFormat>,
}

/// Reads credentials from the terminal. An empty username or EOF cancels.
struct TerminalPrompt;

impl CredentialPrompt for TerminalPrompt {
    fn prompt(&self, message: Option<&str>) -> PromptOutcome {
        if let Some(message) = message {
            eprintln!("login failed: {message}");
        }
        let stdin = io::stdin();
        let mut lines = stdin.lock();
        let Some(username) = read_field(&mut lines, "username: ") else {
            return PromptOutcome::Cancelled;
        };
        let Some(password) = read_field(&mut lines, "password: ") else {
            return PromptOutcome::Cancelled;
        };
        PromptOutcome::Entered(Credentials::new(username, password))
    }
}

fn read_field(input: &mut impl BufRead, label: &str) -> Option<String> {
    eprint!("{label}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let value = line.trim_end_matches(['\r', '\n']).to_string();
            (!value.is_empty()).then_some(value)
        }
    }
}

/// Answers the first prompt with fixed credentials and declines any retry.
struct FixedPrompt(Credentials);

impl CredentialPrompt for FixedPrompt {
    fn prompt(&self, message: Option<&str>) -> PromptOutcome {
        match message {
            None => PromptOutcome::Entered(self.0.clone()),
            Some(reason) => {
                tracing::warn!(reason, "credentials rejected");
                PromptOutcome::Cancelled
            }
        }
    }
}

fn build_coordinator(
    session: SessionConfig,
    credentials: Option<Credentials>,
    main_thread: MainThreadHandle,
) -> Arc<SessionCoordinator> {
    let remote = SimRemote::new(SimCatalog::demo()).with_account(DEMO_USERNAME, DEMO_PASSWORD);
    let prompt: Arc<dyn CredentialPrompt> = match credentials {
        Some(credentials) => Arc::new(FixedPrompt(credentials)),
        None => Arc::new(TerminalPrompt),
    };
    let main_thread: Arc<dyn MainThread> = Arc::new(main_thread);
    SessionCoordinator::new(session, Arc::new(remote), prompt, main_thread)
}

/// Run `work` against a fresh coordinator on a worker thread, servicing UI
/// tasks here until it finishes. The coordinator is shut down afterwards.
fn with_session<T, F>(session: SessionConfig, credentials: Option<Credentials>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Arc<SessionCoordinator>) -> Result<T> + Send + 'static,
{
    let ui = MainThreadQueue::new();
    let coordinator = build_coordinator(session, credentials, ui.handle());
    let worker = {
        let coordinator = coordinator.clone();
        thread::Builder::new()
            .name("stream-input-worker".to_string())
            .spawn(move || work(&coordinator))
            .context("spawn worker thread")?
    };
    while !worker.is_finished() {
        ui.run_for(UI_POLL);
    }
    let result = worker
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?;
    coordinator.shutdown();
    result
}

/// Decode every selected track behind `config.locator`.
pub fn run_play(config: PlayConfig, cancel: CancelToken) -> Result<PlaySummary> {
    let session = config.session.clone();
    let credentials = config.credentials.clone();
    with_session(session, credentials, move |coordinator| {
        play_locator(coordinator, &config, &cancel)
    })
}

fn play_locator(
    coordinator: &Arc<SessionCoordinator>,
    config: &PlayConfig,
    cancel: &CancelToken,
) -> Result<PlaySummary> {
    let mut input = RemoteInput::open(coordinator.clone(), &config.locator, cancel)
        .with_context(|| format!("open {}", config.locator))?;
    let indices: Vec<usize> = match config.track {
        Some(index) => vec![index],
        None => (0..input.track_count()).collect(),
    };
    let mut out = match &config.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => None,
    };

    let mut summary = PlaySummary {
        locator: config.locator.clone(),
        ..PlaySummary::default()
    };
    let mut chunk = AudioFrames::default();
    for index in indices {
        let info = input.get_info(index)?;
        tracing::info!(
            index,
            title = %info.title,
            duration_ms = info.duration_ms,
            "decoding track"
        );
        input
            .decode_initialize(index, cancel)
            .with_context(|| format!("start track {index}"))?;
        if let Some(seconds) = config.seek {
            input.decode_seek(seconds, cancel)?;
        }
        while input.decode_run(&mut chunk, cancel)? {
            summary.frames += chunk.frame_count() as u64;
            if let Some(out) = out.as_mut() {
                for sample in &chunk.samples {
                    out.write_all(&sample.to_le_bytes())?;
                }
                summary.bytes_written += (chunk.samples.len() * 2) as u64;
            }
        }
        summary.tracks_played += 1;
    }
    if let Some(mut out) = out {
        out.flush()?;
    }
    summary.format = input.dynamic_info();
    tracing::info!(
        tracks = summary.tracks_played,
        frames = summary.frames,
        "playback finished"
    );
    Ok(summary)
}

/// Metadata for every track behind the locator.
pub fn run_info(config: QueryConfig, cancel: CancelToken) -> Result<Vec<TrackInfo>> {
    let locator = config.locator.context("a locator is required")?;
    with_session(config.session, config.credentials, move |coordinator| {
        let input = RemoteInput::open(coordinator.clone(), &locator, &cancel)
            .with_context(|| format!("open {locator}"))?;
        let mut tracks = Vec::with_capacity(input.track_count());
        for index in 0..input.track_count() {
            tracks.push(input.get_info(index)?);
        }
        Ok(tracks)
    })
}

/// Session status, taken while the locator (if any) is open.
pub fn run_status(config: QueryConfig, cancel: CancelToken) -> Result<SessionStatus> {
    with_session(config.session, config.credentials, move |coordinator| {
        let _input = match &config.locator {
            Some(locator) => Some(
                RemoteInput::open(coordinator.clone(), locator, &cancel)
                    .with_context(|| format!("open {locator}"))?,
            ),
            None => None,
        };
        Ok(coordinator.status())
    })
}
