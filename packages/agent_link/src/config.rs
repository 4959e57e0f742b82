use std::time::Duration;

/// Tuning knobs for the agent connection manager.
///
/// All durations are wall-clock. The defaults match the `[agents]` section
/// of the bridge configuration file.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound on a single WebSocket open, handshake included.
    pub connect_timeout: Duration,
    /// Attempts made by one `connect` call before giving up.
    pub max_connect_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Growth factor applied to the delay after every further failure.
    pub backoff_multiplier: f64,
    /// Ceiling for any single retry delay.
    pub max_backoff: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// How often the reconnect sweep wakes up.
    pub reconnect_interval: Duration,
    /// Minimum age of the last connect attempt before the sweep retries.
    pub reconnect_cooldown: Duration,
    /// Outbound frames buffered per socket before senders wait.
    pub send_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            reconnect_cooldown: Duration::from_secs(30),
            send_buffer: 256,
        }
    }
}

impl LinkConfig {
    /// Sleep before retry number `retry` (0-based) of a connect loop, never
    /// more than `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Attempts per `connect` call, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_connect_attempts.max(1)
    }
}
