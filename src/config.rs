//! Session settings and device address resolution.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable holding the default panel address.
pub const ADDRESS_ENV: &str = "BK_LIGHT_ADDRESS";

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing and strictness knobs for a [`DisplaySession`](crate::session::DisplaySession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long each stage waits for its acknowledgment.
    pub ack_timeout: Duration,
    /// Sleep between protocol steps; the firmware drops writes that come too fast.
    pub pacing_delay: Duration,
    /// Pause after unsubscribing, before the link is torn down.
    pub settle_delay: Duration,
    /// Bound on each write, subscribe, unsubscribe and disconnect call.
    pub io_timeout: Duration,
    /// Bound on locating and connecting to the panel.
    pub connect_timeout: Duration,
    /// Abort the transmission on the first missing acknowledgment instead of
    /// carrying on to the next step.
    pub strict: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            pacing_delay: DEFAULT_PACING_DELAY,
            settle_delay: DEFAULT_SETTLE_DELAY,
            io_timeout: DEFAULT_IO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            strict: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_pacing_delay(mut self, delay: Duration) -> Self {
        self.pacing_delay = delay;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Picks the panel address: `explicit` first, then `fallback` (typically
/// [`address_from_env`]). Blank values count as missing.
pub fn resolve_address(explicit: Option<&str>, fallback: Option<&str>) -> Result<String> {
    explicit
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .or_else(|| fallback.map(str::trim).filter(|a| !a.is_empty()))
        .map(str::to_owned)
        .ok_or_else(|| {
            Error::Configuration(format!(
                "missing target address: pass it explicitly or set {ADDRESS_ENV}"
            ))
        })
}

pub fn address_from_env() -> Option<String> {
    std::env::var(ADDRESS_ENV).ok()
}
