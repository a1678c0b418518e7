use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

/// Timing knobs for the per-peer connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long a dropped transport may stay `reconnecting` before an ICE restart is attempted.
    pub grace_period_ms: u64,
    /// ICE restarts attempted before the connection is declared failed.
    pub max_restart_attempts: u32,
    /// Delay before the first restart attempt is considered lost; doubles with every attempt.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// An offer/answer exchange that has not produced connectivity within this window fails the connection.
    pub negotiation_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            max_restart_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 16_000,
            negotiation_timeout_ms: 15_000,
        }
    }
}

impl ConnectionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Backoff for the given 1-based restart attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

/// Capture and processing cadence of the local media pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub frame_rate: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub sample_rate: u32,
    /// Samples per audio processing window.
    pub audio_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            frame_width: 640,
            frame_height: 360,
            sample_rate: 48_000,
            audio_window: 480,
        }
    }
}

impl PipelineConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    pub fn audio_interval(&self) -> Duration {
        Duration::from_secs_f64(self.audio_window as f64 / self.sample_rate.max(1) as f64)
    }
}
