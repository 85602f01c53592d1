use std::fmt;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;

use crate::protocol::{ACK_FRAME, ACK_STAGE_ONE, ACK_STAGE_TWO, bytes_to_hex};

/// One acknowledged step of a transmission, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    StageOne,
    StageTwo,
    FrameAck,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::StageOne, Stage::StageTwo, Stage::FrameAck];

    /// The exact notification payload that acknowledges this stage.
    pub fn expected_ack(self) -> &'static [u8] {
        match self {
            Stage::StageOne => &ACK_STAGE_ONE,
            Stage::StageTwo => &ACK_STAGE_TWO,
            Stage::FrameAck => &ACK_FRAME,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::StageOne => "HANDSHAKE_STAGE_ONE",
            Stage::StageTwo => "HANDSHAKE_STAGE_TWO",
            Stage::FrameAck => "FRAME_ACK",
        }
    }

    fn index(self) -> usize {
        match self {
            Stage::StageOne => 0,
            Stage::StageTwo => 1,
            Stage::FrameAck => 2,
        }
    }

    fn matching(payload: &[u8]) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.expected_ack() == payload)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of waiting on a stage. A timeout is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    TimedOut,
}

impl AckOutcome {
    pub fn is_acked(self) -> bool {
        self == AckOutcome::Acked
    }
}

/// Per-session acknowledgment flags, one per [`Stage`].
///
/// `on_notification` is meant to be called from the transport's delivery
/// context while a protocol task waits in `wait_for`; each flag is a watch
/// channel so setting and waiting never race.
#[derive(Debug)]
pub struct AckTracker {
    flags: [watch::Sender<bool>; 3],
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            flags: std::array::from_fn(|_| watch::Sender::new(false)),
        }
    }

    /// Clears all three flags. Call before every transmission attempt.
    pub fn reset(&self) {
        for stage in Stage::ALL {
            self.clear(stage);
        }
    }

    pub fn clear(&self, stage: Stage) {
        self.flags[stage.index()].send_replace(false);
    }

    pub fn is_set(&self, stage: Stage) -> bool {
        *self.flags[stage.index()].borrow()
    }

    /// Matches `payload` byte-for-byte against the three ack patterns and
    /// fires the matching flag. Anything else is logged and ignored.
    pub fn on_notification(&self, payload: &[u8]) -> Option<Stage> {
        debug!("NOTIF {}", bytes_to_hex(payload));
        let stage = Stage::matching(payload)?;
        self.flags[stage.index()].send_if_modified(|fired| {
            let changed = !*fired;
            *fired = true;
            changed
        });
        Some(stage)
    }

    /// Suspends until `stage` has fired or `timeout` elapses. Does not clear
    /// the flag.
    pub async fn wait_for(&self, stage: Stage, timeout: Duration) -> AckOutcome {
        let mut rx = self.flags[stage.index()].subscribe();
        // the sender lives as long as `self`, so the inner result is always Ok
        let fired = tokio::time::timeout(timeout, rx.wait_for(|fired| *fired))
            .await
            .is_ok_and(|r| r.is_ok());
        if fired {
            AckOutcome::Acked
        } else {
            AckOutcome::TimedOut
        }
    }
}
