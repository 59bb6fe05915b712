//! Pull-based decoder facade over the shared remote session.
//!
//! One [`RemoteInput`] per opened locator. Opening only needs the session;
//! decoding additionally needs the process-wide decoder slot, since the remote
//! player can only stream one track at a time.

use std::sync::Arc;

use stream_input_types::{StreamFormat, TrackInfo};

use crate::error::{Error, Result};
use crate::queue::{AudioFrames, AudioSegment};
use crate::remote::{TrackRef, TrackStatus};
use crate::session::{OwnerId, SessionCoordinator};
use crate::sync::{CancelToken, WaitableEvent};

pub struct RemoteInput {
    coordinator: Arc<SessionCoordinator>,
    owner: OwnerId,
    locator: String,
    tracks: Vec<TrackRef>,
    format: Option<StreamFormat>,
}

impl RemoteInput {
    /// Resolve `locator` into its track list and wait for every track's metadata.
    ///
    /// Logs in first if needed. Blocks until the listing and all tracks are
    /// loaded, or `cancel` fires.
    pub fn open(
        coordinator: Arc<SessionCoordinator>,
        locator: &str,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let tracks = {
            let mut session = coordinator.acquire_handle(cancel)?;
            let state = session.connection_state();
            if !state.is_usable() {
                return Err(Error::LoginDenied {
                    reason: format!("could not log in to remote service ({state:?})"),
                });
            }

            let loaded = WaitableEvent::new();
            let listing = session
                .browse(locator, loaded.signal_handle())
                .map_err(|e| Error::remote("browsing", e))?;
            while !listing.is_loaded() {
                session.wait_for_event(&loaded, cancel, None)?;
            }
            listing.tracks()
        };
        if tracks.is_empty() {
            return Err(Error::NoTracks {
                locator: locator.to_string(),
            });
        }
        tracing::info!(locator, tracks = tracks.len(), "listing loaded");

        let input = Self {
            owner: OwnerId::next(),
            locator: locator.to_string(),
            tracks,
            format: None,
            coordinator,
        };
        input.preload(cancel)?;
        Ok(input)
    }

    /// Tag writing is not supported.
    pub fn open_for_write(
        _coordinator: Arc<SessionCoordinator>,
        locator: &str,
        _cancel: &CancelToken,
    ) -> Result<Self> {
        tracing::debug!(locator, "write access refused");
        Err(Error::ReadOnly)
    }

    fn preload(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            {
                let session = self.coordinator.lock_session()?;
                let mut ready = 0;
                for track in &self.tracks {
                    match session.track_status(track) {
                        TrackStatus::Ready => ready += 1,
                        TrackStatus::Loading => {}
                        TrackStatus::Failed(err) => {
                            return Err(Error::remote("preloading track", err));
                        }
                    }
                }
                if ready == self.tracks.len() {
                    return Ok(());
                }
            }
            cancel.sleep(self.coordinator.config().preload_poll)?;
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track(&self, index: usize) -> Result<&TrackRef> {
        self.tracks.get(index).ok_or(Error::TrackIndex {
            index,
            count: self.tracks.len(),
        })
    }

    /// Metadata of track `index`.
    pub fn get_info(&self, index: usize) -> Result<TrackInfo> {
        let track = self.track(index)?;
        let session = self.coordinator.lock_session()?;
        session
            .track_info(track)
            .map_err(|e| Error::remote("reading track metadata", e))
    }

    /// Claim the decoder slot and start streaming track `index`.
    ///
    /// The slot is given back if anything after the claim fails.
    pub fn decode_initialize(&mut self, index: usize, cancel: &CancelToken) -> Result<()> {
        let track = self.track(index)?.clone();
        self.coordinator.take_decoder_slot(self.owner)?;
        let started = self.start_playback(&track, cancel);
        if started.is_err() {
            self.coordinator.release_decoder_slot(self.owner);
        }
        started
    }

    fn start_playback(&mut self, track: &TrackRef, cancel: &CancelToken) -> Result<()> {
        self.coordinator.audio_queue().flush();
        let mut session = self.coordinator.acquire_handle(cancel)?;
        session
            .player_load(track)
            .map_err(|e| Error::remote("load track (including region check)", e))?;
        // Anything delivered before the load belongs to the previous track.
        self.coordinator.audio_queue().flush();
        session.player_play(true);
        self.format = None;
        tracing::info!(owner = %self.owner, track = ?track, "decode started");
        Ok(())
    }

    /// Fill `chunk` with the next block of audio.
    ///
    /// Returns `false` at end of track, after giving back the decoder slot.
    pub fn decode_run(&mut self, chunk: &mut AudioFrames, cancel: &CancelToken) -> Result<bool> {
        self.coordinator.ensure_decoder_slot(self.owner)?;
        match self.coordinator.audio_queue().take(cancel)? {
            AudioSegment::EndOfTrack => {
                self.coordinator.release_decoder_slot(self.owner);
                tracing::info!(owner = %self.owner, "end of track");
                Ok(false)
            }
            AudioSegment::Frames(frames) => {
                self.format = Some(StreamFormat {
                    sample_rate: frames.sample_rate,
                    channels: frames.channels,
                });
                *chunk = frames;
                Ok(true)
            }
        }
    }

    /// Reposition the current track.
    pub fn decode_seek(&mut self, seconds: f64, cancel: &CancelToken) -> Result<()> {
        self.coordinator.ensure_decoder_slot(self.owner)?;
        let position_ms = (seconds.max(0.0) * 1000.0) as u64;
        let mut session = self.coordinator.acquire_handle(cancel)?;
        session.player_play(false);
        self.coordinator.audio_queue().flush();
        session.player_seek(position_ms);
        session.player_play(true);
        tracing::debug!(owner = %self.owner, position_ms, "seek");
        Ok(())
    }

    pub fn can_seek(&self) -> bool {
        true
    }

    /// Format of the most recently decoded chunk.
    pub fn dynamic_info(&self) -> Option<StreamFormat> {
        self.format
    }

    /// Tag writing is not supported.
    pub fn retag(&mut self, _index: usize, _info: &TrackInfo) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

impl Drop for RemoteInput {
    fn drop(&mut self) {
        if !self.coordinator.has_decoder_slot(self.owner) {
            return;
        }
        // Abandoned mid-track: stop the remote player before handing the slot on.
        match self.coordinator.lock_session() {
            Ok(mut session) => {
                session.player_play(false);
                session.player_unload();
            }
            Err(err) => tracing::debug!(owner = %self.owner, error = %err, "skip unload"),
        }
        self.coordinator.audio_queue().flush();
        self.coordinator.release_decoder_slot(self.owner);
        tracing::info!(owner = %self.owner, "decoder abandoned");
    }
}

impl std::fmt::Debug for RemoteInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteInput")
            .field("owner", &self.owner)
            .field("locator", &self.locator)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}
