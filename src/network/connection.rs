//! Peer connections and their I/O tasks
//!
//! A [`PeerConnection`] owns one live TCP stream to one remote peer. The two
//! directions run as independent tasks: a reader that turns frames into
//! [`ConnectionEvent`]s and a writer that drains a queue of outbound
//! messages, so a peer that is slow to read never stalls what we receive
//! from it or from anyone else.

use crate::error::{ChatError, NetworkError, ProtocolError};
use crate::network::{DISCONNECT_DRAIN_GRACE, OUTBOUND_QUEUE_DEPTH};
use crate::protocol::{read_frame, write_frame, ControlKind, Message, Username};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// State of a peer connection
///
/// The TCP dial and the handshake exchange run before a `PeerConnection`
/// value exists, so a value starts out `Established` and only ever moves
/// to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake complete, both I/O tasks running
    Established,
    /// Stream closed or errored; a new connection is required
    Closed,
}

/// Why a connection reached `Closed`
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Remote end closed the stream at a frame boundary
    ClosedByPeer,
    /// Stream ended mid-frame or was reset
    Reset,
    /// Transport-level failure
    Transport(String),
    /// Remote end sent bytes that violate the wire protocol
    ProtocolViolation(String),
}

impl CloseReason {
    fn from_error(err: ChatError) -> Self {
        match err {
            ChatError::Network(NetworkError::ConnectionClosed) => Self::ClosedByPeer,
            ChatError::Network(NetworkError::ConnectionReset) => Self::Reset,
            ChatError::Protocol(e) => Self::ProtocolViolation(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }

    /// Whether this close is a failure rather than an orderly shutdown
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::ClosedByPeer)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer => f.write_str("closed by peer"),
            Self::Reset => f.write_str("connection reset"),
            Self::Transport(reason) => write!(f, "transport error: {}", reason),
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {}", reason),
        }
    }
}

/// Notifications a connection delivers to its owner
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded message arrived from the peer
    Inbound {
        /// Peer the message arrived from
        username: Username,
        /// The decoded message
        message: Message,
    },

    /// The connection transitioned to `Closed`
    ///
    /// Delivered at most once per connection; local `close()` calls do not
    /// produce it.
    Closed {
        /// Peer whose connection closed
        username: Username,
        /// Why it closed
        reason: CloseReason,
    },
}

/// A live, established connection to one remote peer
///
/// Cheap to hand around by reference from the owning peer record. `send` may
/// be called concurrently; messages are serialized through the writer task's
/// queue so frames from different callers never interleave, and arrive in
/// the order `send` was called.
pub struct PeerConnection {
    username: Username,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PeerConnection {
    /// Dial a peer and perform the outbound handshake
    ///
    /// Sends `ConnectRequest` announcing our username and acceptor port,
    /// then waits for the peer's `ConnectAck` within `handshake_timeout`.
    /// On success the connection is `Established` with its I/O tasks
    /// running.
    ///
    /// # Errors
    ///
    /// - `NetworkError::ConnectionFailed` if the dial fails
    /// - `NetworkError::HandshakeTimeout` if no reply arrives in time
    /// - `ProtocolError::UnexpectedMessage` if the reply is not a
    ///   well-formed `ConnectAck`
    pub async fn connect(
        address: SocketAddr,
        local_username: Username,
        listen_port: u16,
        handshake_timeout: Duration,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> crate::Result<Self> {
        let mut stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| NetworkError::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;

        let exchange = async {
            write_frame(
                &mut stream,
                &Message::connect_request(local_username, listen_port),
            )
            .await?;
            read_frame(&mut stream).await
        };

        let reply = timeout(handshake_timeout, exchange)
            .await
            .map_err(|_| NetworkError::HandshakeTimeout {
                address: address.to_string(),
            })??;

        let peer_username = match reply {
            Message::Control {
                kind: ControlKind::ConnectAck,
                payload,
            } => payload
                .username
                .ok_or_else(|| ProtocolError::UnexpectedMessage {
                    expected: "connect_ack with username".to_string(),
                    got: "connect_ack without username".to_string(),
                })?,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "connect_ack".to_string(),
                    got: other.kind_name().to_string(),
                }
                .into())
            }
        };

        tracing::debug!(peer = %peer_username, %address, "outbound handshake complete");
        Ok(Self::spawn(stream, peer_username, address, events))
    }

    /// Perform the inbound handshake on an accepted socket
    ///
    /// Waits for the peer's `ConnectRequest` within `handshake_timeout`.
    /// The `ConnectAck` reply is NOT sent here; the session sends it through
    /// the established connection once the peer is registered, so the ack
    /// implies registration. Returns the connection and the acceptor port
    /// the peer advertised, if any.
    pub async fn accept(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        handshake_timeout: Duration,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> crate::Result<(Self, Option<u16>)> {
        let first = timeout(handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| NetworkError::HandshakeTimeout {
                address: peer_addr.to_string(),
            })??;

        match first {
            Message::Control {
                kind: ControlKind::ConnectRequest,
                payload,
            } => {
                let username =
                    payload
                        .username
                        .ok_or_else(|| ProtocolError::UnexpectedMessage {
                            expected: "connect_request with username".to_string(),
                            got: "connect_request without username".to_string(),
                        })?;
                tracing::debug!(peer = %username, address = %peer_addr, "inbound handshake complete");
                let conn = Self::spawn(stream, username, peer_addr, events);
                Ok((conn, payload.listen_port))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "connect_request".to_string(),
                got: other.kind_name().to_string(),
            }
            .into()),
        }
    }

    /// Take ownership of an established stream and start the I/O tasks
    pub(crate) fn spawn(
        stream: TcpStream,
        username: Username,
        peer_addr: SocketAddr,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        tokio::spawn(read_loop(
            read_half,
            username.clone(),
            events.clone(),
            Arc::clone(&closed),
            Arc::clone(&shutdown),
            shutdown_rx.clone(),
        ));

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            username.clone(),
            events,
            Arc::clone(&closed),
            Arc::clone(&shutdown),
            shutdown_rx,
        ));

        Self {
            username,
            peer_addr,
            outbound,
            closed,
            shutdown,
        }
    }

    /// Queue a message for delivery to the peer
    ///
    /// Waits for queue capacity if the peer is slow; capacity pressure on
    /// one connection never affects another. Messages are delivered in the
    /// order `send` calls complete their enqueue.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::ConnectionClosed` if the connection has
    /// already transitioned to `Closed`.
    pub async fn send(&self, message: Message) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| NetworkError::ConnectionClosed.into())
    }

    /// Queue a message without waiting for capacity
    ///
    /// Used for best-effort traffic like presence broadcasts and
    /// heartbeats, where dropping under backpressure beats stalling the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::SendFailed` if the queue is full and
    /// `NetworkError::ConnectionClosed` if the connection is closed.
    pub fn try_send(&self, message: Message) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendFailed {
                reason: "outbound queue full".to_string(),
            }
            .into(),
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed.into(),
        })
    }

    /// Close the connection
    ///
    /// Idempotent. Cancels both I/O tasks promptly; no `Closed` event is
    /// delivered for a local close, since the caller already knows.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
        }
    }

    /// Queue a final message, then close once the writer drains the queue
    ///
    /// Consuming the connection drops the last queue sender; the writer
    /// flushes whatever is enqueued, the final message included, and then
    /// performs the close. A grace timer hard-closes the connection if the
    /// peer never drains.
    pub(crate) fn finish(self, message: Message) {
        let _ = self.try_send(message);

        let closed = Arc::clone(&self.closed);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_DRAIN_GRACE).await;
            if !closed.swap(true, Ordering::SeqCst) {
                let _ = shutdown.send(true);
            }
        });
    }

    /// Detached sending half of this connection
    ///
    /// Lets a caller that must never wait on queue capacity itself (the
    /// session driver) hand the wait to a task of its own.
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            outbound: self.outbound.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Whether the connection has transitioned to `Closed`
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Established
        }
    }

    /// Username the peer announced during the handshake
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Remote address of the underlying stream
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("username", &self.username)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Sending half of a connection, detached from the owning record
///
/// Cheap to clone; shares the writer queue and closed flag with the
/// connection it came from.
#[derive(Clone)]
pub struct ConnectionSender {
    outbound: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

impl ConnectionSender {
    /// Queue a message, waiting for capacity if the peer is slow
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::ConnectionClosed` if the connection has
    /// already transitioned to `Closed`.
    pub async fn send(&self, message: Message) -> crate::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| NetworkError::ConnectionClosed.into())
    }
}

/// Mark the connection closed and deliver the `Closed` event if this caller
/// won the race to close it. Returns quietly otherwise.
async fn finish_close(
    username: &Username,
    reason: Option<CloseReason>,
    events: &mpsc::Sender<ConnectionEvent>,
    closed: &AtomicBool,
    shutdown: &watch::Sender<bool>,
) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = shutdown.send(true);
    if let Some(reason) = reason {
        let _ = events
            .send(ConnectionEvent::Closed {
                username: username.clone(),
                reason,
            })
            .await;
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    username: Username,
    events: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break None,
            frame = read_frame(&mut read_half) => match frame {
                Ok(message) => {
                    let event = ConnectionEvent::Inbound {
                        username: username.clone(),
                        message,
                    };
                    // Owner gone means the connection is being torn down.
                    if events.send(event).await.is_err() {
                        break None;
                    }
                }
                Err(e) => break Some(CloseReason::from_error(e)),
            },
        }
    };

    if let Some(ref r) = reason {
        if r.is_error() {
            tracing::debug!(peer = %username, reason = %r, "connection read loop ended");
        }
    }
    finish_close(&username, reason, &events, &closed, &shutdown).await;
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Message>,
    username: Username,
    events: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break None,
            message = outbound_rx.recv() => match message {
                // All senders dropped: the owner discarded the connection.
                None => break None,
                Some(message) => {
                    if let Err(e) = write_frame(&mut write_half, &message).await {
                        break Some(CloseReason::from_error(e));
                    }
                }
            },
        }
    };

    finish_close(&username, reason, &events, &closed, &shutdown).await;
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PresenceStatus;
    use tokio::net::TcpListener;

    fn name(s: &str) -> Username {
        Username::new(s).unwrap()
    }

    /// Connect two raw TCP streams through a throwaway listener
    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let (a, b) = stream_pair().await;
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(64);

        let conn_a = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);
        let _conn_b = PeerConnection::spawn(b, name("alice"), "127.0.0.1:2".parse().unwrap(), tx_b);

        for i in 0..20 {
            conn_a
                .send(Message::Chat {
                    sender: name("alice"),
                    body: format!("message {}", i),
                    timestamp: i,
                })
                .await
                .unwrap();
        }

        for i in 0..20 {
            match rx_b.recv().await.unwrap() {
                ConnectionEvent::Inbound {
                    message: Message::Chat { body, .. },
                    ..
                } => assert_eq!(body, format!("message {}", i)),
                other => panic!("expected chat, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_drop_emits_single_closed_event() {
        let (a, b) = stream_pair().await;
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);

        let _conn_a = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);
        let conn_b = PeerConnection::spawn(b, name("alice"), "127.0.0.1:2".parse().unwrap(), tx_b);

        // Abrupt teardown from b's side
        conn_b.close();

        match rx_a.recv().await.unwrap() {
            ConnectionEvent::Closed { username, .. } => assert_eq!(username, name("bob")),
            other => panic!("expected closed, got {:?}", other),
        }

        // Channel must end without a second Closed event
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_local_close_is_idempotent_and_silent() {
        let (a, _b) = stream_pair().await;
        let (tx_a, mut rx_a) = mpsc::channel(16);

        let conn = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);
        assert_eq!(conn.state(), ConnectionState::Established);

        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);

        // No Closed event for a local close
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finish_flushes_queued_frames_before_close() {
        let (a, b) = stream_pair().await;
        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(64);

        let conn_a = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);
        let _conn_b = PeerConnection::spawn(b, name("alice"), "127.0.0.1:2".parse().unwrap(), tx_b);

        conn_a
            .send(Message::chat(name("alice"), "last words"))
            .await
            .unwrap();
        conn_a.finish(Message::disconnect());

        // Everything queued before finish arrives, then the notice, then
        // the orderly close.
        match rx_b.recv().await.unwrap() {
            ConnectionEvent::Inbound {
                message: Message::Chat { body, .. },
                ..
            } => assert_eq!(body, "last words"),
            other => panic!("expected chat, got {:?}", other),
        }
        match rx_b.recv().await.unwrap() {
            ConnectionEvent::Inbound {
                message:
                    Message::Control {
                        kind: ControlKind::Disconnect,
                        ..
                    },
                ..
            } => {}
            other => panic!("expected disconnect notice, got {:?}", other),
        }
        match rx_b.recv().await.unwrap() {
            ConnectionEvent::Closed { reason, .. } => {
                assert_eq!(reason, CloseReason::ClosedByPeer)
            }
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = stream_pair().await;
        let (tx_a, _rx_a) = mpsc::channel(16);

        let conn = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);
        conn.close();

        let err = conn
            .send(Message::presence(name("alice"), PresenceStatus::Online))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Network(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handshake_connect_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx_client, _rx_client) = mpsc::channel(16);
        let (tx_server, _rx_server) = mpsc::channel(16);

        let server = tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, peer_addr, Duration::from_secs(5), tx_server)
                .await
                .unwrap()
        });

        // The acceptor never acks until the session registers the peer, so
        // drive the client side manually to complete the exchange.
        let client = tokio::spawn(async move {
            PeerConnection::connect(addr, name("bob"), 7000, Duration::from_secs(5), tx_client)
                .await
        });

        let (server_conn, advertised_port) = server.await.unwrap();
        assert_eq!(server_conn.username(), &name("bob"));
        assert_eq!(advertised_port, Some(7000));

        // Ack from the server side completes the client handshake
        server_conn
            .send(Message::connect_ack(name("alice")))
            .await
            .unwrap();

        let client_conn = client.await.unwrap().unwrap();
        assert_eq!(client_conn.username(), &name("alice"));
    }

    #[tokio::test]
    async fn test_inbound_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Dial but never send the ConnectRequest
        let _silent = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let err = PeerConnection::accept(stream, peer_addr, Duration::from_millis(50), tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Network(NetworkError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_inbound_handshake_wrong_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        // A chat message where a ConnectRequest belongs
        write_frame(&mut client, &Message::chat(name("mallory"), "hi"))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let err = PeerConnection::accept(stream, peer_addr, Duration::from_secs(1), tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::Protocol(ProtocolError::UnexpectedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_protocol_violation() {
        let (a, mut b) = stream_pair().await;
        let (tx_a, mut rx_a) = mpsc::channel(16);

        let _conn = PeerConnection::spawn(a, name("bob"), "127.0.0.1:1".parse().unwrap(), tx_a);

        // Valid frame, garbage payload
        use tokio::io::AsyncWriteExt;
        let payload = b"{broken";
        b.write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        b.write_all(payload).await.unwrap();

        match rx_a.recv().await.unwrap() {
            ConnectionEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::ProtocolViolation(_)));
                assert!(reason.is_error());
            }
            other => panic!("expected closed, got {:?}", other),
        }
    }
}
