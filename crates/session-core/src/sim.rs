//! In-process stand-in for the remote service.
//!
//! Behaves like the real SDK where it matters to the coordinator: login and
//! browse complete asynchronously on the event-pump thread, track metadata
//! takes a few pump rounds to load, and audio is pushed from a separate
//! delivery thread that backs off whenever the queue refuses a chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stream_input_types::{ConnectionState, StreamFormat, TrackInfo};

use crate::error::{RemoteError, RemoteErrorKind};
use crate::prompt::Credentials;
use crate::remote::{Listing, RemoteConnector, RemoteSession, SessionEvent, TrackRef, TrackStatus};
use crate::session::EventSink;
use crate::sync::EventSignal;

const BUSY_INTERVAL: Duration = Duration::from_millis(5);
const IDLE_INTERVAL: Duration = Duration::from_millis(500);
const REFUSED_BACKOFF: Duration = Duration::from_millis(1);

/// A track in the simulated catalog.
#[derive(Clone, Debug)]
pub struct SimTrack {
    pub id: String,
    pub info: TrackInfo,
    /// Pump rounds before metadata reports loaded.
    pub load_rounds: u32,
    /// Playback is refused, as for a track not licensed in the user's region.
    pub region_locked: bool,
    /// Metadata loading fails.
    pub broken: bool,
}

impl SimTrack {
    pub fn new(id: impl Into<String>, title: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            info: TrackInfo {
                title: title.into(),
                duration_ms,
                ..TrackInfo::default()
            },
            load_rounds: 0,
            region_locked: false,
            broken: false,
        }
    }

    pub fn loading_for(mut self, rounds: u32) -> Self {
        self.load_rounds = rounds;
        self
    }

    pub fn region_locked(mut self) -> Self {
        self.region_locked = true;
        self
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

/// Tracks plus the locators that resolve to them. Every track id is itself a locator.
#[derive(Clone, Debug, Default)]
pub struct SimCatalog {
    tracks: HashMap<String, SimTrack>,
    listings: HashMap<String, Vec<String>>,
}

impl SimCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, track: SimTrack) -> Self {
        self.tracks.insert(track.id.clone(), track);
        self
    }

    /// Register `locator` as a listing of `ids`, in order.
    pub fn with_listing<I, S>(mut self, locator: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listings
            .insert(locator.into(), ids.into_iter().map(Into::into).collect());
        self
    }

    /// Small catalog used by the command-line tool.
    pub fn demo() -> Self {
        let mut album = Vec::new();
        let mut catalog = Self::new();
        for (n, title) in ["Overture", "Interlude", "Finale"].into_iter().enumerate() {
            let id = format!("sim:track:demo-{}", n + 1);
            let mut track = SimTrack::new(&id, title, 2_000 + 500 * n as u64).loading_for(2);
            track.info.artists = vec!["Sim Ensemble".to_string()];
            track.info.album = Some("Demo Album".to_string());
            track.info.album_artist = Some("Sim Ensemble".to_string());
            track.info.track_number = n as u32 + 1;
            track.info.disc_number = 1;
            track.info.year = 2024;
            album.push(id);
            catalog = catalog.with_track(track);
        }
        catalog
            .with_track(SimTrack::new("sim:track:locked", "Unlicensed", 1_000).region_locked())
            .with_listing("sim:album:demo", album)
            .with_listing("sim:playlist:empty", Vec::<String>::new())
    }

    fn resolve(&self, locator: &str) -> Option<Vec<String>> {
        if let Some(ids) = self.listings.get(locator) {
            return Some(ids.clone());
        }
        self.tracks
            .contains_key(locator)
            .then(|| vec![locator.to_string()])
    }

    fn track(&self, track: &TrackRef) -> Option<&SimTrack> {
        self.tracks.get(track.id())
    }
}

/// Counters observed by tests.
#[derive(Debug, Default)]
pub struct SimStats {
    pub connects: AtomicUsize,
    pub login_attempts: AtomicUsize,
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
}

/// Connector producing [`SimSession`]s over a shared catalog.
pub struct SimRemote {
    catalog: Arc<SimCatalog>,
    accounts: HashMap<String, String>,
    stored: Option<Credentials>,
    format: StreamFormat,
    chunk_frames: usize,
    stats: Arc<SimStats>,
}

impl SimRemote {
    pub fn new(catalog: SimCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            accounts: HashMap::new(),
            stored: None,
            format: StreamFormat {
                sample_rate: 44_100,
                channels: 2,
            },
            chunk_frames: 2_048,
            stats: Arc::new(SimStats::default()),
        }
    }

    pub fn with_account(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.insert(username.into(), password.into());
        self
    }

    /// Credentials remembered from an earlier run; enables silent relogin.
    pub fn with_stored_credentials(mut self, credentials: Credentials) -> Self {
        self.stored = Some(credentials);
        self
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames.max(1);
        self
    }

    pub fn stats(&self) -> Arc<SimStats> {
        self.stats.clone()
    }
}

impl RemoteConnector for SimRemote {
    fn connect(&self, events: EventSink) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        let player = Arc::new(Player::new(self.format));
        let delivery = {
            let player = player.clone();
            let events = events.clone();
            let chunk_frames = self.chunk_frames;
            thread::Builder::new()
                .name("sim-delivery".to_string())
                .spawn(move || delivery_thread_main(&player, &events, chunk_frames))
                .map_err(|e| RemoteError::new(RemoteErrorKind::Other, e.to_string()))?
        };
        Ok(Box::new(SimSession {
            catalog: self.catalog.clone(),
            accounts: self.accounts.clone(),
            stored: self.stored.clone(),
            stats: self.stats.clone(),
            events,
            connection: ConnectionState::LoggedOut,
            pending_login: None,
            pending_browses: Vec::new(),
            loading: HashMap::new(),
            player,
            delivery: Some(delivery),
        }))
    }
}

struct SimListing {
    loaded: Arc<AtomicBool>,
    tracks: Vec<TrackRef>,
}

impl Listing for SimListing {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn tracks(&self) -> Vec<TrackRef> {
        if self.is_loaded() {
            self.tracks.clone()
        } else {
            Vec::new()
        }
    }
}

/// Simulated remote session. Created by [`SimRemote`].
pub struct SimSession {
    catalog: Arc<SimCatalog>,
    accounts: HashMap<String, String>,
    stored: Option<Credentials>,
    stats: Arc<SimStats>,
    events: EventSink,
    connection: ConnectionState,
    pending_login: Option<Result<Credentials, RemoteError>>,
    pending_browses: Vec<(Arc<AtomicBool>, EventSignal)>,
    loading: HashMap<String, u32>,
    player: Arc<Player>,
    delivery: Option<JoinHandle<()>>,
}

impl SimSession {
    fn check_credentials(&self, credentials: &Credentials) -> Result<Credentials, RemoteError> {
        match self.accounts.get(&credentials.username) {
            Some(password) if *password == credentials.password => Ok(credentials.clone()),
            _ => Err(RemoteError::new(
                RemoteErrorKind::BadCredentials,
                "bad username or password",
            )),
        }
    }

    fn start_login(&mut self, attempt: Result<Credentials, RemoteError>) {
        self.stats.login_attempts.fetch_add(1, Ordering::Relaxed);
        self.pending_login = Some(attempt);
        self.events.dispatch(SessionEvent::WakeRequested);
    }
}

impl RemoteSession for SimSession {
    fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    fn relogin(&mut self) -> Result<(), RemoteError> {
        let Some(stored) = self.stored.clone() else {
            return Err(RemoteError::new(
                RemoteErrorKind::NoCredentials,
                "no stored credentials",
            ));
        };
        let attempt = self.check_credentials(&stored);
        self.start_login(attempt);
        Ok(())
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError> {
        let attempt = self.check_credentials(credentials);
        self.start_login(attempt);
        Ok(())
    }

    fn process_events(&mut self) -> Result<Duration, RemoteError> {
        if let Some(attempt) = self.pending_login.take() {
            match attempt {
                Ok(credentials) => {
                    self.connection = ConnectionState::LoggedIn;
                    self.stored = Some(credentials);
                    self.events.dispatch(SessionEvent::LoginCompleted(Ok(())));
                }
                Err(err) => {
                    self.connection = ConnectionState::LoggedOut;
                    self.events.dispatch(SessionEvent::LoginCompleted(Err(err)));
                }
            }
        }
        for (loaded, done) in self.pending_browses.drain(..) {
            loaded.store(true, Ordering::Release);
            done.signal();
        }
        let mut busy = false;
        for rounds in self.loading.values_mut() {
            if *rounds > 0 {
                *rounds -= 1;
                busy |= *rounds > 0;
            }
        }
        Ok(if busy { BUSY_INTERVAL } else { IDLE_INTERVAL })
    }

    fn browse(&mut self, locator: &str, done: EventSignal) -> Result<Box<dyn Listing>, RemoteError> {
        let ids = self.catalog.resolve(locator).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::InvalidLocator,
                format!("unknown locator {locator}"),
            )
        })?;
        for id in &ids {
            if let Some(track) = self.catalog.tracks.get(id) {
                self.loading
                    .entry(id.clone())
                    .or_insert(track.load_rounds);
            }
        }
        let loaded = Arc::new(AtomicBool::new(false));
        self.pending_browses.push((loaded.clone(), done));
        self.events.dispatch(SessionEvent::WakeRequested);
        Ok(Box::new(SimListing {
            loaded,
            tracks: ids.into_iter().map(TrackRef::new).collect(),
        }))
    }

    fn track_status(&self, track: &TrackRef) -> TrackStatus {
        match self.catalog.track(track) {
            None => TrackStatus::Failed(RemoteError::new(
                RemoteErrorKind::InvalidLocator,
                "no such track",
            )),
            Some(t) if t.broken => TrackStatus::Failed(RemoteError::new(
                RemoteErrorKind::Other,
                "track failed to load",
            )),
            Some(_) if self.loading.get(track.id()).is_some_and(|r| *r > 0) => {
                TrackStatus::Loading
            }
            Some(_) => TrackStatus::Ready,
        }
    }

    fn track_info(&self, track: &TrackRef) -> Result<TrackInfo, RemoteError> {
        self.catalog
            .track(track)
            .map(|t| t.info.clone())
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::InvalidLocator, "no such track"))
    }

    fn player_load(&mut self, track: &TrackRef) -> Result<(), RemoteError> {
        let t = self
            .catalog
            .track(track)
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::InvalidLocator, "no such track"))?;
        if t.region_locked {
            return Err(RemoteError::new(
                RemoteErrorKind::Unavailable,
                "track not available in your region",
            ));
        }
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let duration_ms = t.info.duration_ms;
        self.player.update(|p| {
            p.total_frames = frames_at(duration_ms, p.format.sample_rate);
            p.position = 0;
            p.loaded = true;
            p.playing = false;
            p.ended = false;
        });
        Ok(())
    }

    fn player_play(&mut self, play: bool) {
        self.player.update(|p| p.playing = play && p.loaded);
    }

    fn player_seek(&mut self, position_ms: u64) {
        self.player.update(|p| {
            p.position = frames_at(position_ms, p.format.sample_rate).min(p.total_frames);
            p.ended = false;
        });
    }

    fn player_unload(&mut self) {
        self.stats.unloads.fetch_add(1, Ordering::Relaxed);
        self.player.update(|p| {
            p.loaded = false;
            p.playing = false;
        });
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let delivery = self.delivery.take();
        // The last coordinator reference can go away inside a delivery
        // callback, in which case the delivery thread already holds the lock.
        let on_delivery_thread = delivery
            .as_ref()
            .is_some_and(|join| join.thread().id() == thread::current().id());
        self.player.stop(on_delivery_thread);
        if let Some(join) = delivery {
            if !on_delivery_thread {
                let _ = join.join();
            }
        }
    }
}

fn frames_at(ms: u64, sample_rate: u32) -> usize {
    let frames = ms.saturating_mul(u64::from(sample_rate)) / 1_000;
    usize::try_from(frames).unwrap_or(usize::MAX)
}

/// Sample value at `frame`; a sawtooth so tests can read the position back.
pub fn sample_at(frame: usize) -> i16 {
    (frame % 32_000) as i16
}

#[derive(Debug)]
struct PlayerState {
    format: StreamFormat,
    total_frames: usize,
    position: usize,
    loaded: bool,
    playing: bool,
    ended: bool,
}

struct Player {
    state: Mutex<PlayerState>,
    changed: Condvar,
    shutdown: AtomicBool,
}

impl Player {
    fn new(format: StreamFormat) -> Self {
        Self {
            state: Mutex::new(PlayerState {
                format,
                total_frames: 0,
                position: 0,
                loaded: false,
                playing: false,
                ended: false,
            }),
            changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut PlayerState)) {
        f(&mut self.lock());
        self.changed.notify_all();
    }

    /// Ask the delivery thread to exit.
    ///
    /// From the delivery thread itself the state lock is already held, so only
    /// the flag is set; the loop checks it before its next chunk.
    fn stop(&self, on_delivery_thread: bool) {
        if on_delivery_thread {
            self.shutdown.store(true, Ordering::Release);
            return;
        }
        let guard = self.lock();
        self.shutdown.store(true, Ordering::Release);
        drop(guard);
        self.changed.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

// Delivers while holding the player lock, so a player call that returns has
// fully taken effect: nothing from before it is delivered afterwards.
fn delivery_thread_main(player: &Player, events: &EventSink, chunk_frames: usize) {
    let mut state = player.lock();
    loop {
        if player.is_stopped() {
            break;
        }
        if !(state.loaded && state.playing && !state.ended) {
            state = player
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }
        if state.position >= state.total_frames {
            state.ended = true;
            state.playing = false;
            events.dispatch(SessionEvent::TrackEnded);
            continue;
        }

        let frames = chunk_frames.min(state.total_frames - state.position);
        let channels = state.format.channels.max(1);
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for frame in state.position..state.position + frames {
            for _ in 0..channels {
                samples.push(sample_at(frame));
            }
        }
        let accepted = events.deliver(&samples, state.format.sample_rate, channels);
        if accepted == 0 {
            let (g, _timeout) = player
                .changed
                .wait_timeout(state, REFUSED_BACKOFF)
                .unwrap_or_else(PoisonError::into_inner);
            state = g;
            continue;
        }
        state.position += accepted.min(frames);
    }
}
