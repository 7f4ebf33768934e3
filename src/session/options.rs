use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::transport::TransportSettings;

/// Per-session timing, retry and framing options.
///
/// Durations accept humantime strings in configuration files (`"500ms"`, `"1h"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Enable checksums on protocols that support them.
    pub checksum: bool,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Read timeout ceiling; also the starting value.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Floor for the adaptive read timeout.
    #[serde(with = "humantime_serde")]
    pub min_read_timeout: Duration,
    /// Extra attempts after the first failed exchange.
    pub read_retries: u32,
    /// Cooldown after retryable failures.
    #[serde(with = "humantime_serde")]
    pub suspend_delay: Duration,
    /// Cooldown after configuration-level failures.
    #[serde(with = "humantime_serde")]
    pub long_suspend_delay: Duration,
    /// Bound on opening the transport.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            checksum: false,
            baud_rate: 9600,
            read_timeout: Duration::from_millis(500),
            min_read_timeout: Duration::from_millis(50),
            read_retries: 2,
            suspend_delay: Duration::from_secs(5),
            long_suspend_delay: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionOptions {
    /// Enable or disable checksums.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout ceiling.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the adaptive timeout floor.
    pub fn with_min_read_timeout(mut self, timeout: Duration) -> Self {
        self.min_read_timeout = timeout;
        self
    }

    /// Set how many times a failed exchange is retried.
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    /// Set the default suspend delay.
    pub fn with_suspend_delay(mut self, delay: Duration) -> Self {
        self.suspend_delay = delay;
        self
    }

    /// Set the long suspend delay.
    pub fn with_long_suspend_delay(mut self, delay: Duration) -> Self {
        self.long_suspend_delay = delay;
        self
    }

    /// Link parameters derived from these options.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            baud_rate: self.baud_rate,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Clamp an observed round trip into the adaptive timeout window.
    pub(crate) fn adaptive_timeout(&self, round_trip: Duration) -> Duration {
        let floor = self.min_read_timeout.min(self.read_timeout);
        round_trip
            .saturating_mul(2)
            .max(floor)
            .min(self.read_timeout)
    }
}
