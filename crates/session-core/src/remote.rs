//! Interface to the remote client SDK.
//!
//! The SDK owns a single session object that must be driven from one thread at a
//! time; the coordinator serializes every call made through [`RemoteSession`].
//! Callbacks the SDK raises on its own threads arrive as typed [`SessionEvent`]s
//! through the [`EventSink`](crate::session::EventSink) handed to the connector.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use stream_input_types::{ConnectionState, TrackInfo};

use crate::error::RemoteError;
use crate::prompt::Credentials;
use crate::session::EventSink;
use crate::sync::EventSignal;

/// Opaque, cheaply cloneable reference to a remote track.
///
/// Dropping the last clone releases the reference.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TrackRef {
    id: Arc<str>,
}

impl TrackRef {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackRef({})", self.id)
    }
}

/// Load state of a remote track's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackStatus {
    Loading,
    Ready,
    Failed(RemoteError),
}

/// Result set of an asynchronous browse (album, artist, playlist, search, track).
///
/// Must only be used while holding the session lock. Dropping it releases the
/// underlying SDK object.
pub trait Listing: Send {
    fn is_loaded(&self) -> bool;
    /// Tracks in listing order. Only meaningful once loaded.
    fn tracks(&self) -> Vec<TrackRef>;
}

/// The single remote session. Every call is made under the coordinator's lock.
pub trait RemoteSession: Send {
    fn connection_state(&self) -> ConnectionState;

    /// Log in again with stored credentials. Completion arrives as
    /// [`SessionEvent::LoginCompleted`].
    fn relogin(&mut self) -> Result<(), RemoteError>;

    /// Log in with explicit credentials. Completion arrives as
    /// [`SessionEvent::LoginCompleted`].
    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError>;

    /// Run pending internal work. Returns how long until the next call is due.
    fn process_events(&mut self) -> Result<Duration, RemoteError>;

    /// Start resolving `locator`; `done` is signalled when the listing finishes loading.
    fn browse(&mut self, locator: &str, done: EventSignal) -> Result<Box<dyn Listing>, RemoteError>;

    fn track_status(&self, track: &TrackRef) -> TrackStatus;

    fn track_info(&self, track: &TrackRef) -> Result<TrackInfo, RemoteError>;

    /// Prepare `track` for playback (includes availability checks).
    fn player_load(&mut self, track: &TrackRef) -> Result<(), RemoteError>;

    /// Start or pause delivery of the loaded track.
    fn player_play(&mut self, play: bool);

    fn player_seek(&mut self, position_ms: u64);

    /// Drop the loaded track. Used when a decoder is abandoned mid-track.
    fn player_unload(&mut self);
}

/// Creates the remote session. Called once, lazily, on first use.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, events: EventSink) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Callbacks raised by the SDK, mapped to typed events.
///
/// Audio delivery is not an event: it needs a return value and goes through
/// [`EventSink::deliver`](crate::session::EventSink::deliver).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    LoginCompleted(Result<(), RemoteError>),
    LoggedOut,
    /// The SDK wants `process_events` called soon.
    WakeRequested,
    /// The loaded track finished delivering.
    TrackEnded,
    /// The account started playing somewhere else.
    PlayTokenLost,
    StartPlayback,
    Log(String),
    MessageToUser(String),
}
