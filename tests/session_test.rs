//! Handshake and session lifecycle tests against an in-memory transport

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use uuid::Uuid;

use bk_light::{
    ACK_FRAME, ACK_STAGE_ONE, ACK_STAGE_TWO, AckOutcome, DisplaySession, Error,
    FRAME_VALIDATION, HANDSHAKE_FIRST, HANDSHAKE_SECOND, NOTIFY_CHARACTERISTIC,
    NotificationCallback, Phase, Result, SessionConfig, Stage, Transport, WRITE_CHARACTERISTIC,
    encode,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(String),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    Write {
        channel: Uuid,
        data: Vec<u8>,
        response: bool,
    },
    Disconnect,
}

/// Which acks the fake panel sends back.
#[derive(Debug, Clone, Copy, Default)]
struct Replies {
    stage_one: bool,
    stage_two: bool,
    frame: bool,
    /// Stage-two ack pattern sent twice right after handshake 1.
    early_stage_two: bool,
}

impl Replies {
    fn all() -> Self {
        Self {
            stage_one: true,
            stage_two: true,
            frame: true,
            early_stage_two: false,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// What `connect` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Up,
    /// Returns `Ok(false)`.
    Down,
    /// Never returns.
    Hang,
    /// Link comes up, then service discovery errors out.
    Fail,
}

/// What happens to the frame write (the one written with response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteFault {
    None,
    Fail,
    Hang,
}

struct MockTransport {
    replies: Replies,
    link: Link,
    frame_write: WriteFault,
    fail_unsubscribe: bool,
    hang_disconnect: bool,
    connected: bool,
    callback: Mutex<Option<NotificationCallback>>,
    log: Arc<Mutex<Vec<Event>>>,
}

impl MockTransport {
    fn new(replies: Replies) -> (Self, Arc<Mutex<Vec<Event>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            replies,
            link: Link::Up,
            frame_write: WriteFault::None,
            fail_unsubscribe: false,
            hang_disconnect: false,
            connected: false,
            callback: Mutex::new(None),
            log: Arc::clone(&log),
        };
        (transport, log)
    }

    fn record(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }

    /// Delivers a notification as if it came from the panel.
    fn inject(&self, data: &[u8]) {
        if let Some(callback) = self.callback.lock().unwrap().as_ref() {
            callback(data);
        }
    }

    fn reply_to(&self, data: &[u8], expect_response: bool) {
        if data == HANDSHAKE_FIRST {
            if self.replies.early_stage_two {
                self.inject(&ACK_STAGE_TWO);
                self.inject(&ACK_STAGE_TWO);
            }
            if self.replies.stage_one {
                self.inject(&ACK_STAGE_ONE);
            }
        } else if data == HANDSHAKE_SECOND {
            if self.replies.stage_two {
                self.inject(&ACK_STAGE_TWO);
            }
        } else if expect_response && self.replies.frame {
            self.inject(&ACK_FRAME);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, address: &str) -> Result<bool> {
        self.record(Event::Connect(address.to_string()));
        match self.link {
            Link::Up => self.connected = true,
            Link::Down => self.connected = false,
            Link::Hang => std::future::pending::<()>().await,
            Link::Fail => {
                self.connected = true;
                return Err(Error::Transport("service discovery failed".into()));
            }
        }
        Ok(self.connected)
    }

    async fn is_connected(&self) -> Result<bool> {
        Ok(self.connected)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.record(Event::Disconnect);
        if self.hang_disconnect {
            std::future::pending::<()>().await;
        }
        self.connected = false;
        Ok(())
    }

    async fn write_characteristic(
        &self,
        channel: Uuid,
        data: &[u8],
        expect_response: bool,
    ) -> Result<()> {
        self.record(Event::Write {
            channel,
            data: data.to_vec(),
            response: expect_response,
        });
        if expect_response {
            match self.frame_write {
                WriteFault::None => {}
                WriteFault::Fail => return Err(Error::Transport("write rejected".into())),
                WriteFault::Hang => std::future::pending::<()>().await,
            }
        }
        self.reply_to(data, expect_response);
        Ok(())
    }

    async fn subscribe_notifications(
        &mut self,
        channel: Uuid,
        callback: NotificationCallback,
    ) -> Result<()> {
        self.record(Event::Subscribe(channel));
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    async fn unsubscribe_notifications(&mut self, channel: Uuid) -> Result<()> {
        self.record(Event::Unsubscribe(channel));
        if self.fail_unsubscribe {
            return Err(Error::Transport("unsubscribe rejected".into()));
        }
        *self.callback.lock().unwrap() = None;
        Ok(())
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig::default()
        .with_ack_timeout(Duration::from_millis(50))
        .with_pacing_delay(Duration::from_millis(5))
        .with_settle_delay(Duration::from_millis(1))
        .with_io_timeout(Duration::from_secs(1))
}

fn writes(log: &Arc<Mutex<Vec<Event>>>) -> Vec<(Vec<u8>, bool)> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Write {
                channel,
                data,
                response,
            } => {
                assert_eq!(*channel, WRITE_CHARACTERISTIC);
                Some((data.clone(), *response))
            }
            _ => None,
        })
        .collect()
}

fn payload() -> Vec<u8> {
    let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
    png.extend(std::iter::repeat_n(0xAB, 92));
    png
}

#[tokio::test]
async fn acknowledged_transmission_follows_protocol_order() {
    let (transport, log) = MockTransport::new(Replies::all());
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    let report = session.send_image(&payload()).await.unwrap();
    assert!(report.is_clean());

    let frame = encode(&payload()).unwrap();
    assert_eq!(
        writes(&log),
        vec![
            (HANDSHAKE_FIRST.to_vec(), false),
            (HANDSHAKE_SECOND.to_vec(), false),
            (frame.into_bytes(), true),
            (FRAME_VALIDATION.to_vec(), false),
        ]
    );

    session.close().await.unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.first(), Some(&Event::Connect(ADDRESS.to_string())));
    assert_eq!(log.get(1), Some(&Event::Subscribe(NOTIFY_CHARACTERISTIC)));
    assert_eq!(
        log[log.len() - 2..],
        [Event::Unsubscribe(NOTIFY_CHARACTERISTIC), Event::Disconnect]
    );
}

#[tokio::test]
async fn silent_panel_still_gets_validation_trailer() {
    let (transport, log) = MockTransport::new(Replies::none());
    let config = fast_config();
    let session = DisplaySession::open(transport, ADDRESS, config.clone())
        .await
        .unwrap();

    let started = Instant::now();
    let report = session.send_image(&payload()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.stage_one, AckOutcome::TimedOut);
    assert_eq!(report.stage_two, AckOutcome::TimedOut);
    assert_eq!(report.frame_ack, AckOutcome::TimedOut);
    assert!(!report.is_clean());
    assert!(elapsed >= config.ack_timeout * 3);
    assert!(elapsed < Duration::from_secs(3));

    let sent = writes(&log);
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[3], (FRAME_VALIDATION.to_vec(), false));
    session.close().await.unwrap();
}

#[tokio::test]
async fn stage_two_ack_before_reclear_is_not_observed() {
    let replies = Replies {
        stage_one: true,
        stage_two: false,
        frame: true,
        early_stage_two: true,
    };
    let (transport, _log) = MockTransport::new(replies);
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    let report = session.send_image(&payload()).await.unwrap();
    assert_eq!(report.stage_one, AckOutcome::Acked);
    assert_eq!(report.stage_two, AckOutcome::TimedOut);
    assert_eq!(report.frame_ack, AckOutcome::Acked);
    session.close().await.unwrap();
}

#[tokio::test]
async fn stage_two_ack_after_reclear_is_observed() {
    let replies = Replies {
        early_stage_two: true,
        ..Replies::all()
    };
    let (transport, _log) = MockTransport::new(replies);
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    let report = session.send_image(&payload()).await.unwrap();
    assert!(report.is_clean());
    session.close().await.unwrap();
}

#[tokio::test]
async fn stale_ack_from_before_transmission_is_discarded() {
    let (transport, _log) = MockTransport::new(Replies::none());
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    session.transport().inject(&ACK_FRAME);
    assert!(session.tracker().is_set(Stage::FrameAck));

    let report = session.send_image(&payload()).await.unwrap();
    assert_eq!(report.frame_ack, AckOutcome::TimedOut);
    session.close().await.unwrap();
}

#[tokio::test]
async fn strict_session_aborts_on_first_missing_ack() {
    let (transport, log) = MockTransport::new(Replies::none());
    let session = DisplaySession::open(transport, ADDRESS, fast_config().with_strict(true))
        .await
        .unwrap();

    match session.send_image(&payload()).await {
        Err(Error::AckTimeout { stage, .. }) => assert_eq!(stage, Stage::StageOne),
        other => panic!("expected AckTimeout, got {other:?}"),
    }
    assert_eq!(writes(&log), vec![(HANDSHAKE_FIRST.to_vec(), false)]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn link_that_never_comes_up_is_a_connection_error() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.link = Link::Down;

    let result = DisplaySession::open(transport, ADDRESS, fast_config()).await;
    assert!(matches!(result, Err(Error::Connection(_))));
    assert!(
        !log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Subscribe(_)))
    );
}

fn subscribed(log: &Arc<Mutex<Vec<Event>>>) -> bool {
    log.lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::Subscribe(_)))
}

#[tokio::test]
async fn connect_that_hangs_is_a_connection_error_and_torn_down() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.link = Link::Hang;
    let config = fast_config().with_connect_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let result = DisplaySession::open(transport, ADDRESS, config).await;
    assert!(matches!(result, Err(Error::Connection(_))), "{:?}", result.err());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!subscribed(&log));
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn connect_error_from_stack_becomes_connection_error() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.link = Link::Fail;

    match DisplaySession::open(transport, ADDRESS, fast_config()).await {
        Err(Error::Connection(msg)) => assert!(msg.contains("service discovery failed"), "{msg}"),
        other => panic!("expected Connection, got {:?}", other.err()),
    }
    assert!(!subscribed(&log));
    // the half-up link is released
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn failed_frame_write_stops_before_validation() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.frame_write = WriteFault::Fail;

    let result = DisplaySession::scoped(transport, ADDRESS, fast_config(), |session| {
        async move { session.send_image(&payload()).await }.boxed()
    })
    .await;

    match result {
        Err(Error::Transport(msg)) => assert_eq!(msg, "write rejected"),
        other => panic!("expected Transport, got {other:?}"),
    }
    let sent = writes(&log);
    assert_eq!(sent.len(), 3);
    assert!(!sent.iter().any(|(data, _)| data == &FRAME_VALIDATION));
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn hanging_frame_write_is_bounded() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.frame_write = WriteFault::Hang;
    let config = fast_config().with_io_timeout(Duration::from_millis(50));
    let session = DisplaySession::open(transport, ADDRESS, config).await.unwrap();

    match session.send_image(&payload()).await {
        Err(Error::TransportTimeout { operation, after }) => {
            assert_eq!(operation, "write");
            assert_eq!(after, Duration::from_millis(50));
        }
        other => panic!("expected TransportTimeout, got {other:?}"),
    }
    assert_eq!(session.phase(), Phase::AwaitStageTwo);
    assert_eq!(writes(&log).len(), 3);
    session.close().await.unwrap();
}

#[tokio::test]
async fn hanging_disconnect_is_reported_by_close() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.hang_disconnect = true;
    let config = fast_config().with_io_timeout(Duration::from_millis(50));
    let session = DisplaySession::open(transport, ADDRESS, config).await.unwrap();

    match session.close().await {
        Err(Error::TransportTimeout { operation, .. }) => assert_eq!(operation, "disconnect"),
        other => panic!("expected TransportTimeout, got {other:?}"),
    }
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn phase_tracks_transmission_progress() {
    let (transport, _log) = MockTransport::new(Replies::all());
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();
    let watcher = session.watch_phase();
    assert_eq!(session.phase(), Phase::Idle);

    session.send_image(&payload()).await.unwrap();
    assert_eq!(session.phase(), Phase::Validated);
    assert_eq!(*watcher.borrow(), Phase::Validated);
    session.close().await.unwrap();

    let (transport, _log) = MockTransport::new(Replies::none());
    let strict = DisplaySession::open(transport, ADDRESS, fast_config().with_strict(true))
        .await
        .unwrap();
    assert!(strict.send_image(&payload()).await.is_err());
    assert_eq!(strict.phase(), Phase::AwaitStageOne);
    strict.close().await.unwrap();
}

#[tokio::test]
async fn close_disconnects_even_when_unsubscribe_fails() {
    let (mut transport, log) = MockTransport::new(Replies::all());
    transport.fail_unsubscribe = true;
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    session.close().await.unwrap();
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn scoped_session_closes_after_failed_body() {
    let (transport, log) = MockTransport::new(Replies::all());

    let result: Result<()> = DisplaySession::scoped(transport, ADDRESS, fast_config(), |_session| {
        async { Err(Error::Transport("write failed".into())) }.boxed()
    })
    .await;

    match result {
        Err(Error::Transport(msg)) => assert_eq!(msg, "write failed"),
        other => panic!("expected body error, got {other:?}"),
    }
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn scoped_session_returns_body_value() {
    let (transport, log) = MockTransport::new(Replies::all());
    let png = payload();

    let report = DisplaySession::scoped(transport, ADDRESS, fast_config(), move |session| {
        async move { session.send_image(&png).await }.boxed()
    })
    .await
    .unwrap();

    assert!(report.is_clean());
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Disconnect));
}

#[tokio::test]
async fn concurrent_sends_do_not_interleave() {
    let (transport, log) = MockTransport::new(Replies::all());
    let session = DisplaySession::open(transport, ADDRESS, fast_config())
        .await
        .unwrap();

    let first = encode(b"first").unwrap();
    let second = encode(b"second").unwrap();
    let (a, b) = tokio::join!(session.send_frame(&first), session.send_frame(&second));
    assert!(a.unwrap().is_clean());
    assert!(b.unwrap().is_clean());

    let sent = writes(&log);
    assert_eq!(sent.len(), 8);
    for transmission in sent.chunks(4) {
        assert_eq!(transmission[0].0, HANDSHAKE_FIRST.to_vec());
        assert_eq!(transmission[1].0, HANDSHAKE_SECOND.to_vec());
        assert!(transmission[2].1);
        assert_eq!(transmission[3].0, FRAME_VALIDATION.to_vec());
    }
    session.close().await.unwrap();
}
