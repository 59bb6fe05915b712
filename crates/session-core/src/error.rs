//! Error taxonomy shared by the session core.

use std::fmt;

use crate::session::OwnerId;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by session, queue and decode operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A cooperative abort was observed during a wait.
    #[error("operation cancelled")]
    Cancelled,
    /// The user declined to log in, or the remote refused the session.
    #[error("login denied: {reason}")]
    LoginDenied { reason: String },
    /// Another decoder already owns audio delivery.
    #[error("decoder slot busy (held by {holder})")]
    DecoderBusy { holder: OwnerId },
    /// A concurrent claim won the decoder slot first.
    #[error("lost the race for the decoder slot")]
    DecoderRace,
    /// The remote session reported a non-OK status.
    #[error("{context} failed: {source}")]
    RemoteOperationFailed {
        context: &'static str,
        #[source]
        source: RemoteError,
    },
    /// A decode step ran without owning the decoder slot.
    #[error("bugcheck: {owner} should own the decoder slot")]
    CoordinationBugFatal { owner: OwnerId },
    /// The locator resolved to a listing without tracks.
    #[error("{locator}: empty (or failed to load?) listing")]
    NoTracks { locator: String },
    /// A track index outside the opened listing.
    #[error("track index {index} out of range ({count} tracks)")]
    TrackIndex { index: usize, count: usize },
    /// Remote entries cannot be retagged.
    #[error("remote entries are read-only")]
    ReadOnly,
    /// The coordinator was shut down.
    #[error("session coordinator shut down")]
    ShutDown,
}

impl Error {
    /// Wrap a remote failure with the operation that produced it.
    pub fn remote(context: &'static str, source: RemoteError) -> Self {
        Error::RemoteOperationFailed { context, source }
    }

    /// `true` for outcomes callers are expected to see under contention.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::DecoderBusy { .. } | Error::DecoderRace)
    }
}

/// Failure categories reported by the remote session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Relogin was requested but nothing is stored to log in with.
    NoCredentials,
    /// The remote rejected the supplied username/password.
    BadCredentials,
    /// The locator does not name a supported resource.
    InvalidLocator,
    /// The resource is unavailable (region, removed, ...).
    Unavailable,
    /// Network or transport problem.
    Network,
    /// Anything else.
    Other,
}

/// Status reported by the remote session for a failed call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_failure_message_names_context() {
        let err = Error::remote(
            "load track",
            RemoteError::new(RemoteErrorKind::Unavailable, "track not available in region"),
        );
        assert_eq!(
            err.to_string(),
            "load track failed: track not available in region"
        );
    }

    #[test]
    fn contention_covers_busy_and_race_only() {
        assert!(Error::DecoderRace.is_contention());
        assert!(
            Error::DecoderBusy {
                holder: OwnerId::from_raw(7).unwrap()
            }
            .is_contention()
        );
        assert!(!Error::Cancelled.is_contention());
    }
}
