use serde::{Deserialize, Serialize};

/// Connection state reported by the remote session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or the session has not reported a state yet.
    Undefined,
    /// Explicitly logged out.
    LoggedOut,
    /// Logged in and online.
    LoggedIn,
    /// Logged in, but the network connection dropped.
    Disconnected,
    /// Logged in with cached credentials and no network.
    Offline,
}

impl ConnectionState {
    /// `true` when the remote will serve requests without logging in again.
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectionState::LoggedIn | ConnectionState::Offline)
    }
}

/// Authentication state tracked by the session coordinator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    #[default]
    LoggedOut,
    /// A credential prompt is outstanding (or its login is in flight).
    LoggingIn,
    LoggedIn,
}

/// Metadata for one remote track, as reported by the remote session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    /// Track length in milliseconds.
    pub duration_ms: u64,
    /// 1-based position on its album; `0` when unknown.
    pub track_number: u32,
    /// 1-based disc number; `0` when unknown.
    pub disc_number: u32,
    /// Album release year; `0` when unknown.
    pub year: u32,
}

impl TrackInfo {
    /// Track length in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

/// Format of the most recently decoded audio.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Point-in-time view of a session coordinator.
///
/// Values may change immediately after the snapshot is taken.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    /// Whether the remote session has been created yet.
    pub session_created: bool,
    pub login_state: LoginState,
    /// Message from the last rejected login, if any.
    pub last_login_error: Option<String>,
    /// Owner id of the active decoder, if one holds the slot.
    pub decoder_owner: Option<u64>,
    /// Segments currently queued for the decoder.
    pub queued_segments: usize,
    /// Hard capacity of the audio queue in segments.
    pub queue_capacity: usize,
    /// Segments dropped because the queue was soft-full.
    pub dropped_segments: u64,
}
