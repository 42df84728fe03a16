use std::time::Duration;

/// Timing and sizing knobs for the node core.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Budget the protocol engine gets to externalize a request.
    pub request_timeout_ms: u64,
    /// Minimum wall-clock spacing between ballot counters on one slot; the
    /// verifier's rate gate rejects ballot `n` before `n` intervals elapse.
    pub retry_interval_ms: u64,
    /// Node loop sleep between scheduling turns.
    pub tick_ms: u64,
    /// Upper bound on a single transport frame.
    pub max_frame_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2_000,
            retry_interval_ms: 1_000,
            tick_ms: 5,
            max_frame_bytes: 8_000_000,
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
