//! The serial link session task.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::state::LinkState;
use crate::core::{DEFAULT_DRAIN_QUIET, FrameError, LinkError};
use crate::framing::{Framer, FramingMode, ParserConfig};

/// Default cause text for a timeout between chunks of an incomplete frame.
const STALL_CAUSE: &str = "too much time between two data chunks";

/// Configuration for a [`SerialLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Quiet period with no byte arrivals before the link is trusted.
    pub drain_quiet: Duration,

    /// Wire variant used on the read side.
    pub framing: FramingMode,

    /// Parser settings (inactivity timeout, size bound, channel tag).
    pub parser: ParserConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            drain_quiet: DEFAULT_DRAIN_QUIET,
            framing: FramingMode::default(),
            parser: ParserConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Set the drain quiet period.
    pub fn drain_quiet(mut self, quiet: Duration) -> Self {
        self.drain_quiet = quiet;
        self
    }

    /// Set the wire variant.
    pub fn framing(mut self, mode: FramingMode) -> Self {
        self.framing = mode;
        self
    }

    /// Set the parser configuration.
    pub fn parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }
}

/// Event emitted by a link session.
#[derive(Debug)]
pub enum LinkEvent {
    /// The drain quiet period elapsed; queued sends were flushed and the link
    /// now relays in both directions.
    Open,

    /// A complete inbound frame (or raw chunk in pass-through mode).
    Data(Bytes),

    /// A driver or framing error. Frame timeouts leave the link up; anything
    /// else ends the session.
    Error(LinkError),

    /// The session ended through [`SerialLink::close`].
    Closed,
}

enum Command {
    Send(Vec<u8>),
    ExpectResponse(String),
    Close(oneshot::Sender<()>),
}

struct Session {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<LinkState>,
}

/// Handle to the serial side of the bridge.
///
/// Each `open` spawns one session task that owns the stream, the framer, the
/// pending-send queue, and both timers; the handle only carries channels, so
/// it is cheap and the task's state cannot be mutated from outside.
pub struct SerialLink {
    config: LinkConfig,
    session: Option<Session>,
}

impl SerialLink {
    /// Create a link with no running session.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Open a session over the stream produced by `connect`.
    ///
    /// Any prior session is closed first. The returned receiver carries the
    /// session's [`LinkEvent`]s; an open failure arrives there as the first
    /// event rather than as a return value, so the caller's handling of
    /// errors-at-open and errors-later is one code path.
    pub async fn open<S, F>(&mut self, connect: F) -> mpsc::Receiver<LinkEvent>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = std::io::Result<S>> + Send + 'static,
    {
        self.close().await;

        let framer = self.config.framing.framer(self.config.parser.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(LinkState::Closed);

        let drain_quiet = self.config.drain_quiet;
        let frame_timeout = self.config.parser.timeout;
        tokio::spawn(run_session(
            connect,
            framer,
            drain_quiet,
            frame_timeout,
            cmd_rx,
            event_tx,
            state_tx,
        ));

        self.session = Some(Session { cmd_tx, state_rx });
        event_rx
    }

    /// Current lifecycle state ([`LinkState::Closed`] with no session).
    pub fn state(&self) -> LinkState {
        self.session
            .as_ref()
            .map(|s| *s.state_rx.borrow())
            .unwrap_or(LinkState::Closed)
    }

    /// Submit outbound bytes.
    ///
    /// While the link is still draining the buffer is queued and flushed, in
    /// submission order, once the quiet period elapses; once open it is
    /// written straight to the driver.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotOpen)?;
        session
            .cmd_tx
            .send(Command::Send(data))
            .await
            .map_err(|_| LinkError::NotOpen)
    }

    /// Arm the one-shot inactivity timer manually.
    ///
    /// For callers that just sent a request and expect a response: if nothing
    /// arrives within the configured frame timeout, a
    /// [`FrameError::Timeout`] carrying `cause` is emitted. Works in
    /// pass-through mode too, where the timer never arms automatically.
    pub async fn expect_response(&self, cause: impl Into<String>) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotOpen)?;
        session
            .cmd_tx
            .send(Command::ExpectResponse(cause.into()))
            .await
            .map_err(|_| LinkError::NotOpen)
    }

    /// Close the running session, if any.
    ///
    /// Idempotent; resolves once the task has released the driver handle.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if session.cmd_tx.send(Command::Close(ack_tx)).await.is_ok() {
                // The task may already be gone after a failure; that counts
                // as closed.
                let _ = ack_rx.await;
            }
        }
    }
}

/// Watch-published state with table-validated assignments.
struct StateCell {
    current: LinkState,
    tx: watch::Sender<LinkState>,
}

impl StateCell {
    fn new(tx: watch::Sender<LinkState>) -> Self {
        let current = *tx.borrow();
        Self { current, tx }
    }

    fn current(&self) -> LinkState {
        self.current
    }

    fn advance(&mut self, to: LinkState) {
        if !self.current.can_transition(to) {
            error!(
                from = self.current.name(),
                to = to.name(),
                "illegal link state transition rejected"
            );
            return;
        }
        trace!(from = self.current.name(), to = to.name(), "link state");
        self.current = to;
        let _ = self.tx.send(to);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<S, F>(
    connect: F,
    mut framer: Box<dyn Framer>,
    drain_quiet: Duration,
    frame_timeout: Duration,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<LinkEvent>,
    state_tx: watch::Sender<LinkState>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = std::io::Result<S>> + Send + 'static,
{
    let mut state = StateCell::new(state_tx);
    state.advance(LinkState::Opening);

    let stream = match connect.await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "serial open failed");
            let _ = events.send(LinkEvent::Error(e.into())).await;
            state.advance(LinkState::Failed);
            return;
        }
    };

    info!(quiet_ms = drain_quiet.as_millis() as u64, "serial stream open, draining");
    state.advance(LinkState::Draining);

    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut read_buf = vec![0u8; 4096];

    // Sends issued before the link is trusted. Flushed FIFO exactly once at
    // the drain->open transition, then never used again.
    let mut queue: Vec<Vec<u8>> = Vec::new();

    let mut drain_deadline = Some(Instant::now() + drain_quiet);
    let mut frame_deadline: Option<Instant> = None;
    let mut timeout_cause = String::from(STALL_CAUSE);

    let mut close_ack: Option<oneshot::Sender<()>> = None;
    let mut failed = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(buf)) => {
                    if state.current() == LinkState::Open {
                        trace!(len = buf.len(), "serial write");
                        if let Err(e) = wr.write_all(&buf).await {
                            let _ = events.send(LinkEvent::Error(e.into())).await;
                            failed = true;
                            break;
                        }
                    } else {
                        debug!(len = buf.len(), "link not drained yet, queueing send");
                        queue.push(buf);
                    }
                }
                Some(Command::ExpectResponse(cause)) => {
                    timeout_cause = cause;
                    frame_deadline = Some(Instant::now() + frame_timeout);
                }
                Some(Command::Close(ack)) => {
                    close_ack = Some(ack);
                    break;
                }
                None => break,
            },

            res = rd.read(&mut read_buf) => match res {
                Ok(0) => {
                    let _ = events.send(LinkEvent::Error(LinkError::ClosedByPeer)).await;
                    failed = true;
                    break;
                }
                Ok(n) => {
                    if state.current() == LinkState::Draining {
                        // Post-open line noise: discard and restart the quiet
                        // period. The framer never sees these bytes.
                        trace!(n, "draining noise");
                        drain_deadline = Some(Instant::now() + drain_quiet);
                    } else {
                        match framer.feed(&read_buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    if events.send(LinkEvent::Data(frame)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = events.send(LinkEvent::Error(e.into())).await;
                                failed = true;
                                break;
                            }
                        }
                        // An arrival always cancels the running timer; rearm
                        // only while a frame is still incomplete.
                        frame_deadline = if framer.pending() {
                            timeout_cause = String::from(STALL_CAUSE);
                            Some(Instant::now() + frame_timeout)
                        } else {
                            None
                        };
                    }
                }
                Err(e) => {
                    let _ = events.send(LinkEvent::Error(e.into())).await;
                    failed = true;
                    break;
                }
            },

            _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                drain_deadline = None;
                state.advance(LinkState::Open);
                info!(queued = queue.len(), "quiet period elapsed, link open");
                let mut flush_err = None;
                for buf in queue.drain(..) {
                    if let Err(e) = wr.write_all(&buf).await {
                        flush_err = Some(e);
                        break;
                    }
                }
                if let Some(e) = flush_err {
                    let _ = events.send(LinkEvent::Error(e.into())).await;
                    failed = true;
                    break;
                }
                if events.send(LinkEvent::Open).await.is_err() {
                    return;
                }
            },

            _ = sleep_until_opt(frame_deadline), if frame_deadline.is_some() => {
                // Single-shot: fire once, leave the framer's state as-is.
                frame_deadline = None;
                let err = FrameError::timeout(framer.channel(), timeout_cause.as_str());
                warn!(error = %err, "frame inactivity timeout");
                if events.send(LinkEvent::Error(err.into())).await.is_err() {
                    return;
                }
            },
        }
    }

    // Release the driver handle.
    let _ = wr.shutdown().await;

    if failed {
        state.advance(LinkState::Failed);
    } else {
        // Stream end: whatever is still buffered goes out rather than being
        // silently dropped.
        if let Some(residue) = framer.flush() {
            let _ = events.send(LinkEvent::Data(residue)).await;
        }
        state.advance(LinkState::Closed);
        let _ = events.send(LinkEvent::Closed).await;
    }

    if let Some(ack) = close_ack {
        let _ = ack.send(());
    }
}

/// Open the serial device at `path` with the given baud rate.
///
/// The returned stream plugs straight into [`SerialLink::open`].
#[cfg(feature = "serial")]
pub fn open_serial_stream(path: &str, baud: u32) -> std::io::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;
    tokio_serial::new(path, baud)
        .open_native_async()
        .map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DEFAULT_FRAME_TIMEOUT;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn passthrough_link() -> SerialLink {
        SerialLink::new(LinkConfig::default())
    }

    fn framed_link() -> SerialLink {
        SerialLink::new(LinkConfig::default().framing(FramingMode::LengthPrefixed))
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_noise_and_flushes_queue_fifo() {
        let (local, mut device) = duplex(1024);
        let mut link = passthrough_link();
        let mut events = link.open(async move { Ok(local) }).await;

        // Line noise right after open must never surface as data.
        device.write_all(&[0x00, 0x00, 0x00]).await.unwrap();

        // Sends during the drain go to the queue.
        link.send(vec![0x01]).await.unwrap();
        link.send(vec![0x02, 0x03]).await.unwrap();

        // First event is Open, not Data.
        match events.recv().await {
            Some(LinkEvent::Open) => {}
            other => panic!("expected Open, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Open);

        // Queued buffers reach the driver in enqueue order.
        let mut buf = [0u8; 3];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03]);

        // Steady state: post-drain sends and inbound data both flow.
        link.send(vec![0xAB]).await.unwrap();
        let mut one = [0u8; 1];
        device.read_exact(&mut one).await.unwrap();
        assert_eq!(one, [0xAB]);

        device.write_all(&[0x42, 0x43]).await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Data(d)) => assert_eq!(&d[..], &[0x42, 0x43]),
            other => panic!("expected Data, got {other:?}"),
        }

        link.close().await;
        match events.recv().await {
            Some(LinkEvent::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_timeout_fires_once_then_parser_resumes() {
        let (local, mut device) = duplex(1024);
        let mut link = framed_link();
        let mut events = link.open(async move { Ok(local) }).await;

        match events.recv().await {
            Some(LinkEvent::Open) => {}
            other => panic!("expected Open, got {other:?}"),
        }

        // Header promises 4 bytes, only one arrives: the stall timer fires
        // exactly once.
        device.write_all(&[0x04, 0x00, 0x00, 0x00, 0xAA]).await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Error(LinkError::Frame(FrameError::Timeout { .. }))) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }

        // The timeout did not reset the parser: completing the payload still
        // yields the whole frame.
        device.write_all(&[0xBB, 0xCC, 0xDD]).await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Data(d)) => assert_eq!(&d[..], &[0xAA, 0xBB, 0xCC, 0xDD]),
            other => panic!("expected Data, got {other:?}"),
        }

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_before_expiry_cancels_and_rearms() {
        let (local, mut device) = duplex(1024);
        let mut link = framed_link();
        let mut events = link.open(async move { Ok(local) }).await;
        assert!(matches!(events.recv().await, Some(LinkEvent::Open)));

        device.write_all(&[0x02, 0x00, 0x00, 0x00, 0x10]).await.unwrap();
        // Just before expiry, the completing chunk arrives.
        tokio::time::sleep(DEFAULT_FRAME_TIMEOUT - Duration::from_millis(50)).await;
        device.write_all(&[0x11]).await.unwrap();

        match events.recv().await {
            Some(LinkEvent::Data(d)) => assert_eq!(&d[..], &[0x10, 0x11]),
            other => panic!("expected Data, got {other:?}"),
        }

        // Nothing is buffered anymore, so no spurious timeout may follow.
        tokio::time::sleep(2 * DEFAULT_FRAME_TIMEOUT).await;
        assert!(events.try_recv().is_err());

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_response_arms_timer_in_passthrough() {
        let (local, _device) = duplex(1024);
        let mut link = passthrough_link();
        let mut events = link.open(async move { Ok(local) }).await;
        assert!(matches!(events.recv().await, Some(LinkEvent::Open)));

        link.expect_response("remote side did not respond").await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Error(LinkError::Frame(FrameError::Timeout { cause, .. }))) => {
                assert_eq!(cause, "remote side did not respond");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_surfaces_as_error_event() {
        let mut link = passthrough_link();
        let mut events = link
            .open(async {
                Err::<tokio::io::DuplexStream, _>(std::io::Error::other("no such port"))
            })
            .await;

        match events.recv().await {
            Some(LinkEvent::Error(LinkError::Io(e))) => {
                assert_eq!(e.to_string(), "no such port");
            }
            other => panic!("expected Io error, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_eof_fails_the_session() {
        let (local, device) = duplex(1024);
        let mut link = passthrough_link();
        let mut events = link.open(async move { Ok(local) }).await;
        assert!(matches!(events.recv().await, Some(LinkEvent::Open)));

        drop(device);
        match events.recv().await {
            Some(LinkEvent::Error(LinkError::ClosedByPeer)) => {}
            other => panic!("expected ClosedByPeer, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_length_fails_the_session() {
        let (local, mut device) = duplex(1024);
        let mut link = SerialLink::new(
            LinkConfig::default()
                .framing(FramingMode::LengthPrefixed)
                .parser(ParserConfig::default().max_frame_size(16)),
        );
        let mut events = link.open(async move { Ok(local) }).await;
        assert!(matches!(events.recv().await, Some(LinkEvent::Open)));

        device.write_all(&[0xFF, 0xFF, 0xFF, 0x00]).await.unwrap();
        match events.recv().await {
            Some(LinkEvent::Error(LinkError::Frame(FrameError::Oversized { max: 16, .. }))) => {}
            other => panic!("expected Oversized, got {other:?}"),
        }
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_session_is_not_open() {
        let link = passthrough_link();
        assert!(matches!(link.send(vec![1]).await, Err(LinkError::NotOpen)));
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let (local, _device) = duplex(1024);
        let mut link = passthrough_link();
        let _events = link.open(async move { Ok(local) }).await;
        link.close().await;
        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_closes_prior_session() {
        let (local_a, _device_a) = duplex(1024);
        let (local_b, mut device_b) = duplex(1024);
        let mut link = passthrough_link();

        let _events_a = link.open(async move { Ok(local_a) }).await;
        let mut events_b = link.open(async move { Ok(local_b) }).await;

        assert!(matches!(events_b.recv().await, Some(LinkEvent::Open)));
        link.send(vec![0x7E]).await.unwrap();
        let mut one = [0u8; 1];
        device_b.read_exact(&mut one).await.unwrap();
        assert_eq!(one, [0x7E]);

        link.close().await;
    }
}
