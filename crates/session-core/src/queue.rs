//! Bounded queue of audio segments between the remote delivery callback and the
//! decode loop.
//!
//! The remote session pushes segments from its own thread:
//! - delivery callback → [`BoundedAudioQueue::add`] (dropped while soft-full)
//! - end-of-track callback → [`BoundedAudioQueue::add_end_of_track`]
//!
//! The decode loop blocks in [`BoundedAudioQueue::take`].
//!
//! The last `headroom` slots are reserved for the end-of-track sentinel, so a
//! soft-full queue still accepts it. A producer that hits the hard capacity
//! spins (unlock, sleep, relock) for a bounded number of retries instead of
//! waiting on a second condition variable. Sentinels are rare relative to
//! consumption, so this path is practically never taken.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::sync::CancelToken;

/// One unit of audio delivered by the remote session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AudioSegment {
    Frames(AudioFrames),
    /// The current track finished; nothing follows until the next load.
    EndOfTrack,
}

/// Interleaved signed 16-bit PCM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioFrames {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrames {
    /// Number of whole frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Fixed-capacity FIFO with a blocking, cancellable consumer.
///
/// ## Design
/// - **Single producer identity / single consumer identity** per decode session.
/// - Capacity `C` bounds memory; at `C - H` occupancy the queue is "soft full" and
///   [`add`](Self::add) drops instead of blocking.
/// - The queue has its own private lock, so `take` never contends with the
///   session lock the event pump needs.
pub struct BoundedAudioQueue {
    inner: Mutex<VecDeque<AudioSegment>>,
    not_empty: Condvar,
    capacity: usize,
    headroom: usize,
    take_poll: Duration,
    producer_retry_sleep: Duration,
    producer_retry_limit: usize,
    dropped: AtomicU64,
    last_drop_log_ms: AtomicU64,
}

impl BoundedAudioQueue {
    /// Create a queue with the given capacity and headroom, default timings otherwise.
    pub fn new(capacity: usize, headroom: usize) -> Self {
        Self::from_config(&SessionConfig {
            queue_capacity: capacity,
            queue_headroom: headroom,
            ..SessionConfig::default()
        })
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
            headroom: config.queue_headroom.min(capacity - 1),
            take_poll: config.take_poll,
            producer_retry_sleep: config.producer_retry_sleep,
            producer_retry_limit: config.producer_retry_limit,
            dropped: AtomicU64::new(0),
            last_drop_log_ms: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// Occupancy at which payload segments start being dropped.
    pub fn soft_limit(&self) -> usize {
        self.capacity - self.headroom
    }

    /// Current queued segments (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `true` once occupancy reaches `C - H`. Producers use this as the accept gate.
    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.soft_limit()
    }

    /// Payload segments dropped because the queue was soft-full.
    pub fn dropped_segments(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append a payload segment unless the queue is soft-full.
    ///
    /// Returns `false` (and leaves the queue unchanged) when the segment was dropped.
    pub fn add(&self, samples: Vec<i16>, sample_rate: u32, channels: u16) -> bool {
        {
            let q = self.lock();
            if q.len() >= self.soft_limit() {
                drop(q);
                self.note_drop();
                return false;
            }
        }
        self.push_with_retry(AudioSegment::Frames(AudioFrames {
            samples,
            sample_rate,
            channels,
        }))
    }

    /// Append the end-of-track sentinel, using the reserved headroom.
    ///
    /// Returns `false` only if the queue stayed at hard capacity for the whole
    /// retry budget.
    pub fn add_end_of_track(&self) -> bool {
        self.push_with_retry(AudioSegment::EndOfTrack)
    }

    fn push_with_retry(&self, segment: AudioSegment) -> bool {
        let mut q = self.lock();
        let mut retries = 0;
        while q.len() >= self.capacity {
            if retries >= self.producer_retry_limit {
                tracing::warn!(
                    capacity = self.capacity,
                    retries,
                    "audio queue stayed full; segment dropped"
                );
                return false;
            }
            drop(q);
            thread::sleep(self.producer_retry_sleep);
            q = self.lock();
            retries += 1;
        }
        q.push_back(segment);
        drop(q);
        self.not_empty.notify_one();
        true
    }

    /// Pop the oldest segment, blocking while the queue is empty.
    ///
    /// Wakes every `take_poll` to re-check `cancel`. Fails with
    /// [`Error::Cancelled`](crate::Error::Cancelled) without touching the queue.
    pub fn take(&self, cancel: &CancelToken) -> Result<AudioSegment> {
        let mut q = self.lock();
        loop {
            if let Some(segment) = q.pop_front() {
                return Ok(segment);
            }
            cancel.check()?;
            let (g, _timeout) = self
                .not_empty
                .wait_timeout(q, self.take_poll)
                .unwrap_or_else(PoisonError::into_inner);
            q = g;
        }
    }

    /// Drop every queued segment. Returns how many were discarded.
    pub fn flush(&self) -> usize {
        let mut q = self.lock();
        let discarded = q.len();
        q.clear();
        drop(q);
        if discarded > 0 {
            tracing::debug!(discarded, "audio queue flushed");
        }
        discarded
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AudioSegment>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.last_drop_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.last_drop_log_ms.store(now, Ordering::Relaxed);
            tracing::debug!(
                dropped_total = dropped,
                soft_limit = self.soft_limit(),
                "audio queue soft-full; delivery throttled"
            );
        }
    }
}
