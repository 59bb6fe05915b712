use std::time::Duration;

/// Tuning parameters shared by the queue, coordinator and event pump.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Hard capacity of the audio queue in segments.
    pub queue_capacity: usize,
    /// Slots below capacity reserved for end-of-track markers.
    pub queue_headroom: usize,
    /// How often a blocked `take` re-checks its cancel token.
    pub take_poll: Duration,
    /// Sleep between retries when a producer finds the queue at hard capacity.
    pub producer_retry_sleep: Duration,
    /// Retries before a producer gives up on a hard-full queue.
    pub producer_retry_limit: usize,
    /// How often a caller waiting for login re-checks state and cancellation.
    pub login_poll: Duration,
    /// Poll interval while waiting for track metadata after `open`.
    pub preload_poll: Duration,
    /// Next pump timeout after the remote session fails to process events.
    pub pump_error_backoff: Duration,
}

impl Default for SessionConfig {
    /// Defaults matching the remote SDK's expected delivery cadence.
    fn default() -> Self {
        Self {
            queue_capacity: 255,
            queue_headroom: 5,
            take_poll: Duration::from_millis(100),
            producer_retry_sleep: Duration::from_millis(1),
            producer_retry_limit: 2_000,
            login_poll: Duration::from_millis(100),
            preload_poll: Duration::from_millis(50),
            pump_error_backoff: Duration::from_secs(1),
        }
    }
}
