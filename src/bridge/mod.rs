//! Single-tenant socket relay.
//!
//! [`Bridge`] exposes one TCP listening socket, accepts exactly one client at
//! a time, and relays bytes bidirectionally between that client and the
//! [`SerialLink`]:
//!
//! ```text
//! socket bytes -> Bridge -> SerialLink::send -> driver write
//! driver read  -> framer -> LinkEvent::Data  -> Bridge -> socket write
//! ```
//!
//! One call to [`Bridge::listen`] is one session: bind, accept, relay,
//! disconnect, return: exactly one [`BridgeEvent::Disconnected`] per
//! session. The bridge never re-listens on its own; a supervisor reacts to
//! the disconnect (or to `listen` returning) and starts the next cycle.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::core::{BridgeError, DEFAULT_SOCKET_PORT, LinkError};
use crate::link::{LinkEvent, SerialLink};

mod state;

pub use state::ConnectionState;

/// Configuration for a [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the listener binds to.
    pub addr: SocketAddr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SOCKET_PORT)),
        }
    }
}

impl BridgeConfig {
    /// Bind to all interfaces on `port`.
    pub fn port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Bind to a specific address.
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }
}

/// Lifecycle event emitted by a bridge session.
#[derive(Debug)]
pub enum BridgeEvent {
    /// The listener is bound and waiting for its single client.
    Listening(SocketAddr),

    /// A client connected; relay is active.
    Connected(SocketAddr),

    /// The serial side failed; the socket side was closed so the client sees
    /// a drop instead of a hang.
    LinkFailed(LinkError),

    /// The session ended. Emitted exactly once per accepted connection; a
    /// supervisor reacts by starting a fresh `listen` cycle.
    Disconnected,
}

/// The socket/serial relay.
pub struct Bridge {
    config: BridgeConfig,
    link: SerialLink,
    link_events: tokio::sync::mpsc::Receiver<LinkEvent>,
    events: tokio::sync::mpsc::Sender<BridgeEvent>,
    state: ConnectionState,
}

impl Bridge {
    /// Create a bridge over an already-opened link.
    ///
    /// `link_events` is the receiver returned by
    /// [`SerialLink::open`](crate::link::SerialLink::open); the bridge owns
    /// the read side of the link from here on.
    pub fn new(
        config: BridgeConfig,
        link: SerialLink,
        link_events: tokio::sync::mpsc::Receiver<LinkEvent>,
    ) -> (Self, tokio::sync::mpsc::Receiver<BridgeEvent>) {
        let (events, events_rx) = tokio::sync::mpsc::channel(16);
        (
            Self {
                config,
                link,
                link_events,
                events,
                state: ConnectionState::Closed,
            },
            events_rx,
        )
    }

    /// Observational socket connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// The serial link handle, e.g. for a supervisor's shutdown path.
    pub fn link_mut(&mut self) -> &mut SerialLink {
        &mut self.link
    }

    /// Run one listen/accept/relay/disconnect cycle.
    ///
    /// Binds, waits for a single client, stops accepting (single-tenant),
    /// relays until the socket closes, emits [`BridgeEvent::Disconnected`]
    /// once, and returns. Serial data arriving while no client is attached is
    /// dropped. Errors also leave the connection state back at
    /// [`ConnectionState::Closed`], so a supervisor may simply call `listen`
    /// again after a transient bind or accept failure.
    pub async fn listen(&mut self) -> Result<(), BridgeError> {
        self.state = self.state.advance(ConnectionState::Connecting)?;
        match self.run_cycle().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed cycle must still land back in Closed, or the next
                // listen attempt would be rejected by the transition table.
                if self.state != ConnectionState::Closed {
                    self.state = self.state.advance(ConnectionState::Closed)?;
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&mut self) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let local = listener.local_addr()?;
        info!(%local, "waiting for connection");
        self.emit(BridgeEvent::Listening(local)).await;

        // Local borrows keep the select! arms disjoint from `self`.
        let events = self.events.clone();
        let link = &self.link;
        let link_events = &mut self.link_events;

        let accepted = loop {
            tokio::select! {
                res = listener.accept() => break Some(res?),
                ev = link_events.recv() => match ev {
                    Some(LinkEvent::Data(d)) => {
                        trace!(len = d.len(), "no client attached, dropping serial data");
                    }
                    Some(LinkEvent::Open) => debug!("serial link open"),
                    Some(LinkEvent::Error(e)) => {
                        warn!(error = %e, "serial link error while listening");
                        let _ = events.send(BridgeEvent::LinkFailed(e)).await;
                    }
                    Some(LinkEvent::Closed) => debug!("serial link closed"),
                    None => break None,
                },
            }
        };
        let Some((socket, peer)) = accepted else {
            self.state = self.state.advance(ConnectionState::Closed)?;
            return Err(BridgeError::Link(LinkError::NotOpen));
        };
        // Single-tenant: no further incoming connections on this cycle.
        drop(listener);

        self.state = self.state.advance(ConnectionState::Connected)?;
        info!(%peer, "socket connected");
        let _ = events.send(BridgeEvent::Connected(peer)).await;

        let (mut rd, mut wr) = socket.into_split();
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        debug!("socket closed by client");
                        break;
                    }
                    Ok(n) => {
                        trace!(n, "socket -> serial");
                        if let Err(e) = link.send(buf[..n].to_vec()).await {
                            warn!(error = %e, "serial link rejected send");
                            let _ = events.send(BridgeEvent::LinkFailed(e)).await;
                            break;
                        }
                    }
                    // A socket-side error is logged and takes the normal
                    // close path; it must not crash the process.
                    Err(e) => {
                        warn!(error = %e, "socket read error");
                        break;
                    }
                },
                ev = link_events.recv() => match ev {
                    Some(LinkEvent::Data(frame)) => {
                        trace!(len = frame.len(), "serial -> socket");
                        if let Err(e) = wr.write_all(&frame).await {
                            warn!(error = %e, "socket write error");
                            break;
                        }
                    }
                    Some(LinkEvent::Error(e)) => {
                        warn!(error = %e, "serial link error, closing socket side");
                        let _ = events.send(BridgeEvent::LinkFailed(e)).await;
                        break;
                    }
                    Some(LinkEvent::Open) => debug!("serial link open"),
                    Some(LinkEvent::Closed) => {
                        debug!("serial link closed");
                        break;
                    }
                    None => {
                        warn!("serial link session ended");
                        break;
                    }
                },
            }
        }

        // Close path: the socket halves are owned here and dropped exactly
        // once, so there is no handler to detach and no handle to clear.
        drop(rd);
        drop(wr);
        self.state = self.state.advance(ConnectionState::Closed)?;
        info!("socket disconnected");
        self.emit(BridgeEvent::Disconnected).await;
        Ok(())
    }

    async fn emit(&self, event: BridgeEvent) {
        // A supervisor that dropped its receiver just stops observing.
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{FramingMode, ParserConfig};
    use crate::link::LinkConfig;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config() -> BridgeConfig {
        BridgeConfig::default().addr("127.0.0.1:0".parse().unwrap())
    }

    async fn expect_listening(
        events: &mut tokio::sync::mpsc::Receiver<BridgeEvent>,
    ) -> SocketAddr {
        match events.recv().await {
            Some(BridgeEvent::Listening(addr)) => addr,
            other => panic!("expected Listening, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bidirectional_relay_and_single_disconnect() {
        let (local, mut device) = duplex(1024);
        let mut link = SerialLink::new(LinkConfig::default().drain_quiet(Duration::ZERO));
        let link_events = link.open(async move { Ok(local) }).await;

        let (mut bridge, mut events) = Bridge::new(test_config(), link, link_events);
        let session = tokio::spawn(async move {
            bridge.listen().await.unwrap();
            bridge
        });

        let addr = expect_listening(&mut events).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(events.recv().await, Some(BridgeEvent::Connected(_))));

        // socket -> serial
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // serial -> socket
        device.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client disconnect: exactly one Disconnected, then the cycle returns.
        drop(client);
        assert!(matches!(events.recv().await, Some(BridgeEvent::Disconnected)));
        let bridge = session.await.unwrap();
        assert_eq!(bridge.connection_state(), ConnectionState::Closed);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_supervisor_relisten_cycle() {
        let (local, mut device) = duplex(1024);
        let mut link = SerialLink::new(LinkConfig::default().drain_quiet(Duration::ZERO));
        let link_events = link.open(async move { Ok(local) }).await;

        let (mut bridge, mut events) = Bridge::new(test_config(), link, link_events);
        let supervisor = tokio::spawn(async move {
            // Two cycles, the way the external supervisor drives re-listen.
            for _ in 0..2 {
                bridge.listen().await.unwrap();
            }
        });

        for round in 0..2u8 {
            let addr = expect_listening(&mut events).await;
            let mut client = TcpStream::connect(addr).await.unwrap();
            assert!(matches!(events.recv().await, Some(BridgeEvent::Connected(_))));

            client.write_all(&[round]).await.unwrap();
            let mut one = [0u8; 1];
            device.read_exact(&mut one).await.unwrap();
            assert_eq!(one, [round]);

            drop(client);
            assert!(matches!(events.recv().await, Some(BridgeEvent::Disconnected)));
        }

        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_recovers_after_failed_bind() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let (local, _device) = duplex(1024);
        let mut link = SerialLink::new(LinkConfig::default().drain_quiet(Duration::ZERO));
        let link_events = link.open(async move { Ok(local) }).await;
        let (mut bridge, mut events) =
            Bridge::new(BridgeConfig::default().addr(addr), link, link_events);

        // Port taken: the cycle fails, but the state machine must be back at
        // Closed rather than stuck mid-transition.
        let err = bridge.listen().await.unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(bridge.connection_state(), ConnectionState::Closed);

        // Port freed: the next cycle comes up normally.
        drop(blocker);
        let session = tokio::spawn(async move {
            bridge.listen().await.unwrap();
            bridge
        });
        let addr = expect_listening(&mut events).await;
        let client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(events.recv().await, Some(BridgeEvent::Connected(_))));
        drop(client);
        assert!(matches!(events.recv().await, Some(BridgeEvent::Disconnected)));
        let bridge = session.await.unwrap();
        assert_eq!(bridge.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_serial_failure_drops_the_client() {
        let (local, mut device) = duplex(1024);
        let mut link = SerialLink::new(
            LinkConfig::default()
                .drain_quiet(Duration::ZERO)
                .framing(FramingMode::LengthPrefixed)
                .parser(ParserConfig::default().max_frame_size(8)),
        );
        let link_events = link.open(async move { Ok(local) }).await;

        let (mut bridge, mut events) = Bridge::new(test_config(), link, link_events);
        let session = tokio::spawn(async move { bridge.listen().await });

        let addr = expect_listening(&mut events).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(events.recv().await, Some(BridgeEvent::Connected(_))));

        // Corrupted length header: the link fails, the bridge must close the
        // socket side so the client observes a drop rather than a hang.
        device.write_all(&[0xFF, 0xFF, 0xFF, 0x7F]).await.unwrap();
        assert!(matches!(events.recv().await, Some(BridgeEvent::LinkFailed(_))));
        assert!(matches!(events.recv().await, Some(BridgeEvent::Disconnected)));

        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "client should see the connection drop");

        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serial_data_without_client_is_dropped() {
        let (local, mut device) = duplex(1024);
        let mut link = SerialLink::new(LinkConfig::default().drain_quiet(Duration::ZERO));
        let link_events = link.open(async move { Ok(local) }).await;

        let (mut bridge, mut events) = Bridge::new(test_config(), link, link_events);
        let session = tokio::spawn(async move {
            bridge.listen().await.unwrap();
            bridge
        });

        let addr = expect_listening(&mut events).await;

        // Serial chatter before any client connects must go nowhere.
        device.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(events.recv().await, Some(BridgeEvent::Connected(_))));

        // The first bytes the client sees are post-connect bytes.
        device.write_all(b"later").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"later");

        drop(client);
        assert!(matches!(events.recv().await, Some(BridgeEvent::Disconnected)));
        session.await.unwrap();
    }
}
