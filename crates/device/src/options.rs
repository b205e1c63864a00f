//! Session tuning options

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and string-table settings for a [`crate::DeviceSession`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Upper bound on one event-pump wait, in milliseconds
    #[serde(default = "SessionOptions::default_event_timeout")]
    pub event_timeout_ms: u64,
    /// How long shutdown waits for cancelled transfers to complete
    #[serde(default = "SessionOptions::default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Timeout for descriptor control requests
    #[serde(default = "SessionOptions::default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Language for string descriptors (0 = first supported language)
    #[serde(default)]
    pub language_id: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            event_timeout_ms: Self::default_event_timeout(),
            drain_timeout_ms: Self::default_drain_timeout(),
            control_timeout_ms: Self::default_control_timeout(),
            language_id: 0,
        }
    }
}

impl SessionOptions {
    fn default_event_timeout() -> u64 {
        100
    }

    fn default_drain_timeout() -> u64 {
        2000
    }

    fn default_control_timeout() -> u64 {
        1000
    }

    pub fn event_timeout(&self) -> Duration {
        // A zero timeout would turn the pump into a busy loop
        Duration::from_millis(self.event_timeout_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.event_timeout(), Duration::from_millis(100));
        assert_eq!(options.drain_timeout(), Duration::from_secs(2));
        assert_eq!(options.language_id, 0);
    }

    #[test]
    fn test_zero_event_timeout_is_clamped() {
        let options = SessionOptions {
            event_timeout_ms: 0,
            ..SessionOptions::default()
        };
        assert_eq!(options.event_timeout(), Duration::from_millis(1));
    }
}
