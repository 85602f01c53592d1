use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::ack::{AckOutcome, AckTracker, Stage};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    FRAME_VALIDATION, Frame, HANDSHAKE_FIRST, HANDSHAKE_SECOND, NOTIFY_CHARACTERISTIC,
    WRITE_CHARACTERISTIC, encode,
};

/// Invoked for every inbound notification on a subscribed channel.
/// Must not block; it runs on the transport's delivery context.
pub type NotificationCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Link capability the session drives.
/// Implement this for your BLE stack or a mock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link. `Ok(false)` means the stack gave up without an error.
    async fn connect(&mut self, address: &str) -> Result<bool>;
    async fn is_connected(&self) -> Result<bool>;
    async fn disconnect(&mut self) -> Result<()>;
    /// Write `data` to `channel`, optionally requesting a link-level response.
    async fn write_characteristic(
        &self,
        channel: Uuid,
        data: &[u8],
        expect_response: bool,
    ) -> Result<()>;
    async fn subscribe_notifications(
        &mut self,
        channel: Uuid,
        callback: NotificationCallback,
    ) -> Result<()>;
    async fn unsubscribe_notifications(&mut self, channel: Uuid) -> Result<()>;
}

/// Where a transmission currently is. Every phase advances to the next,
/// whether or not its acknowledgment arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitStageOne,
    AwaitStageTwo,
    AwaitFrameAck,
    Validated,
}

/// Per-stage outcomes of one `send_frame` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionReport {
    pub stage_one: AckOutcome,
    pub stage_two: AckOutcome,
    pub frame_ack: AckOutcome,
}

impl TransmissionReport {
    /// True when the panel acknowledged every stage.
    pub fn is_clean(&self) -> bool {
        self.stage_one.is_acked() && self.stage_two.is_acked() && self.frame_ack.is_acked()
    }
}

/// One connected panel.
///
/// - `transport`: the link, owned for the lifetime of the session
/// - `tracker`: ack flags fed by the notification callback
/// - `in_flight`: serialises transmissions on this session
/// - `phase`: where the current (or last) transmission got to
pub struct DisplaySession<T: Transport> {
    transport: T,
    tracker: Arc<AckTracker>,
    config: SessionConfig,
    in_flight: Mutex<()>,
    phase: watch::Sender<Phase>,
}

async fn quiet_disconnect<T: Transport>(transport: &mut T, limit: Duration) {
    if let Err(e) = bounded(limit, "disconnect", transport.disconnect()).await {
        warn!("disconnect after failed open: {e}");
    }
}

async fn bounded<F, R>(limit: Duration, operation: &'static str, fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::TransportTimeout {
            operation,
            after: limit,
        })?
}

impl<T: Transport> DisplaySession<T> {
    /// Connect to `address` and subscribe to the acknowledgment channel.
    ///
    /// Fails with [`Error::Connection`] when the link can't be brought up.
    pub async fn open(mut transport: T, address: &str, config: SessionConfig) -> Result<Self> {
        info!("connecting to {address}");
        let attempt =
            tokio::time::timeout(config.connect_timeout, transport.connect(address)).await;
        let failure = match attempt {
            Ok(Ok(true)) if transport.is_connected().await.unwrap_or(false) => None,
            Ok(Ok(_)) => Some(Error::Connection(format!("bluetooth link to {address} failed"))),
            Ok(Err(Error::Connection(msg))) => Some(Error::Connection(msg)),
            Ok(Err(e)) => Some(Error::Connection(format!("connect to {address}: {e}"))),
            Err(_) => Some(Error::Connection(format!(
                "{address} not reachable within {:?}",
                config.connect_timeout
            ))),
        };
        if let Some(e) = failure {
            // the link may be half up, or the stack may still be scanning
            quiet_disconnect(&mut transport, config.io_timeout).await;
            return Err(e);
        }

        let tracker = Arc::new(AckTracker::new());
        let sink = Arc::clone(&tracker);
        let callback: NotificationCallback = Box::new(move |data: &[u8]| {
            sink.on_notification(data);
        });
        let subscribed = bounded(
            config.io_timeout,
            "subscribe",
            transport.subscribe_notifications(NOTIFY_CHARACTERISTIC, callback),
        )
        .await;
        if let Err(e) = subscribed {
            quiet_disconnect(&mut transport, config.io_timeout).await;
            return Err(e);
        }
        debug!("subscribed to {NOTIFY_CHARACTERISTIC}");

        Ok(Self {
            transport,
            tracker,
            config,
            in_flight: Mutex::new(()),
            phase: watch::Sender::new(Phase::Idle),
        })
    }

    /// Opens a session, runs `body` against it, and closes it on every
    /// return path. An error from `body` wins over an error from closing.
    pub async fn scoped<F, R>(
        transport: T,
        address: &str,
        config: SessionConfig,
        body: F,
    ) -> Result<R>
    where
        F: for<'s> FnOnce(&'s DisplaySession<T>) -> BoxFuture<'s, Result<R>>,
    {
        let session = Self::open(transport, address, config).await?;
        let outcome = body(&session).await;
        let closed = session.close().await;
        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("close after failed transaction: {close_err}");
                Err(e)
            }
        }
    }

    /// Unsubscribe (best effort), let the link settle, then disconnect.
    pub async fn close(mut self) -> Result<()> {
        if self.transport.is_connected().await.unwrap_or(false) {
            let unsubscribed = bounded(
                self.config.io_timeout,
                "unsubscribe",
                self.transport.unsubscribe_notifications(NOTIFY_CHARACTERISTIC),
            )
            .await;
            if let Err(e) = unsubscribed {
                warn!("unsubscribe failed, disconnecting anyway: {e}");
            }
            tokio::time::sleep(self.config.settle_delay).await;
        }
        bounded(self.config.io_timeout, "disconnect", self.transport.disconnect()).await?;
        info!("disconnected");
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tracker(&self) -> &AckTracker {
        &self.tracker
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Phase of the transmission in progress, or where the last one stopped.
    /// A strict session that gave up stays in the phase whose ack never came.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Frame `payload` (typically a 32x32 PNG) and transmit it.
    pub async fn send_image(&self, payload: &[u8]) -> Result<TransmissionReport> {
        self.send_image_with_delay(payload, self.config.pacing_delay).await
    }

    pub async fn send_image_with_delay(
        &self,
        payload: &[u8],
        delay: Duration,
    ) -> Result<TransmissionReport> {
        let frame = encode(payload)?;
        self.send_frame_with_delay(&frame, delay).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<TransmissionReport> {
        self.send_frame_with_delay(frame, self.config.pacing_delay).await
    }

    /// Runs the handshake and transfer for one frame.
    ///
    /// Steps:
    /// 1. Reset ack flags, send handshake 1, await stage one
    /// 2. Re-clear stage two, send handshake 2, await stage two
    /// 3. Write the frame with response, await the frame ack
    /// 4. Send the validation trailer
    ///
    /// A missing ack is reported in the returned [`TransmissionReport`] and
    /// the next step runs anyway, unless the session is strict.
    pub async fn send_frame_with_delay(
        &self,
        frame: &Frame,
        delay: Duration,
    ) -> Result<TransmissionReport> {
        let _guard = self.in_flight.lock().await;
        self.enter(Phase::Idle);
        debug!("sending {}-byte frame", frame.len());

        self.tracker.reset();
        self.write(&HANDSHAKE_FIRST, false).await?;
        self.enter(Phase::AwaitStageOne);
        let stage_one = self.await_stage(Stage::StageOne).await?;
        tokio::time::sleep(delay).await;

        // the stage-two pattern also shows up in unrelated firmware chatter
        self.tracker.clear(Stage::StageTwo);
        self.write(&HANDSHAKE_SECOND, false).await?;
        self.enter(Phase::AwaitStageTwo);
        let stage_two = self.await_stage(Stage::StageTwo).await?;
        tokio::time::sleep(delay).await;

        self.write(frame.as_bytes(), true).await?;
        self.enter(Phase::AwaitFrameAck);
        let frame_ack = self.await_stage(Stage::FrameAck).await?;
        tokio::time::sleep(delay).await;

        self.write(&FRAME_VALIDATION, false).await?;
        self.enter(Phase::Validated);

        Ok(TransmissionReport {
            stage_one,
            stage_two,
            frame_ack,
        })
    }

    fn enter(&self, to: Phase) {
        let from = self.phase.send_replace(to);
        debug!("phase {from:?} -> {to:?}");
    }

    async fn write(&self, data: &[u8], expect_response: bool) -> Result<()> {
        bounded(
            self.config.io_timeout,
            "write",
            self.transport
                .write_characteristic(WRITE_CHARACTERISTIC, data, expect_response),
        )
        .await
    }

    async fn await_stage(&self, stage: Stage) -> Result<AckOutcome> {
        let timeout = self.config.ack_timeout;
        match self.tracker.wait_for(stage, timeout).await {
            AckOutcome::Acked => {
                info!("{}_OK", stage.label());
                Ok(AckOutcome::Acked)
            }
            AckOutcome::TimedOut if self.config.strict => {
                warn!("{}_TIMEOUT", stage.label());
                Err(Error::AckTimeout {
                    stage,
                    after: timeout,
                })
            }
            AckOutcome::TimedOut => {
                warn!("{}_TIMEOUT", stage.label());
                Ok(AckOutcome::TimedOut)
            }
        }
    }
}
