//! BK-Light library: push images to 32x32 LED panels via BLE.
//!
//! Main modules:
//! - protocol: frame codec and wire constants
//! - ack: acknowledgment flags for the three-stage handshake
//! - session: transport trait and the transmission state machine
//! - ble: btleplug transport and scanner
//! - config: session timing and address resolution
//! - font, render: 32x32 canvases for text, counters and images

pub mod ack;
pub mod ble;
pub mod config;
pub mod error;
pub mod font;
pub mod protocol;
pub mod render;
pub mod session;

/// BLE API: scan for panels, btleplug transport
pub use ble::{BleTransport, DeviceInfo, scan};
pub use ack::{AckOutcome, AckTracker, Stage};
pub use config::{SessionConfig, resolve_address};
pub use error::{Error, Result};
/// Protocol utilities (frames, constants)
pub use protocol::*;
pub use session::{DisplaySession, NotificationCallback, Phase, TransmissionReport, Transport};
