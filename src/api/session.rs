//! Session implementation - the main entry point for confab
//!
//! A [`Session`] owns the listening socket, the peer registry, and the set
//! of live connections. Every registry mutation and routing decision runs on
//! one driver task, fed by channels, so presence and routing are never
//! observed in a torn state; connection I/O itself runs on per-connection
//! tasks and is unaffected by the driver's pacing.

use crate::api::config::{PresencePolicy, SessionConfig};
use crate::api::events::{Event, EventHandlers, SubscriptionHandle};
use crate::api::registry::{PeerInfo, PeerRegistry};
use crate::error::{ChatError, NetworkError, ProtocolError, SessionError};
use crate::network::{
    ChatListener, CloseReason, ConnectionEvent, ConnectionSender, PeerConnection,
};
use crate::protocol::{ControlKind, Message, PresenceStatus, Username};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_QUEUE_DEPTH: usize = 32;
const CONNECTION_EVENT_QUEUE_DEPTH: usize = 256;
const HANDSHAKE_QUEUE_DEPTH: usize = 16;

/// Current operational state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session has been built but not started
    Created,
    /// Listener bound, driver running
    Running,
    /// Session has stopped
    Stopped,
}

/// Builder for creating Session instances with progressive configuration
///
/// # Examples
///
/// ```no_run
/// use confab::{SessionBuilder, Event};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut session = SessionBuilder::new()
///     .with_username("alice")
///     .with_listen_port(0)
///     .build()?;
///
/// session.on_event(|event| {
///     if let Event::ChatReceived { from, body, .. } = event {
///         println!("{}: {}", from, body);
///     }
/// });
///
/// session.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create a new SessionBuilder with default settings
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    /// Set the username announced to peers
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.config.username = username.into();
        self
    }

    /// Set the address to bind the listening socket to
    pub fn with_listen_addr(mut self, addr: std::net::IpAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the port for accepting incoming connections
    ///
    /// Default is 0 (ephemeral port); the actual port is available from
    /// [`Session::local_addr`] once started.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.config.listen_port = port;
        self
    }

    /// Set the deadline for the application-level handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the maximum number of concurrently connected peers
    pub fn with_max_peers(mut self, count: usize) -> Self {
        self.config.max_peers = count;
        self
    }

    /// Set the presence detection policy
    pub fn with_presence_policy(mut self, policy: PresencePolicy) -> Self {
        self.config.presence = policy;
        self
    }

    /// Build the Session instance
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> crate::Result<Session> {
        self.config.validate()?;
        let username = Username::new(self.config.username.clone())?;

        Ok(Session {
            config: self.config,
            username,
            event_handlers: EventHandlers::new(),
            state: Arc::new(RwLock::new(SessionState::Created)),
            runtime: Mutex::new(None),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles the session holds while running
struct Runtime {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    driver: JoinHandle<()>,
}

/// A peer-to-peer chat session
///
/// The session accepts inbound connections, dials peers on request, routes
/// chat messages, and propagates presence changes. Chat, presence and
/// failure notifications reach the embedding application through
/// [`on_event`](Self::on_event) callbacks.
pub struct Session {
    config: SessionConfig,
    username: Username,
    event_handlers: EventHandlers,
    state: Arc<RwLock<SessionState>>,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Session {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the session
    ///
    /// Binds the listening socket and spawns the driver task. Binding is
    /// the only fatal failure of session creation; it is returned to the
    /// caller and nothing is left running.
    ///
    /// # Errors
    ///
    /// - `SessionError::AlreadyRunning` if the session is running
    /// - `NetworkError::BindFailed` if the listening port is unavailable
    pub async fn start(&mut self) -> crate::Result<()> {
        if *self.state.read() == SessionState::Running {
            return Err(SessionError::AlreadyRunning.into());
        }

        let bind_addr = SocketAddr::new(self.config.listen_addr, self.config.listen_port);
        let listener = ChatListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (conn_tx, conn_rx) = mpsc::channel(CONNECTION_EVENT_QUEUE_DEPTH);
        let (established_tx, established_rx) = mpsc::channel(HANDSHAKE_QUEUE_DEPTH);

        let driver = Driver {
            username: self.username.clone(),
            advertised_port: local_addr.port(),
            handshake_timeout: self.config.handshake_timeout,
            max_peers: self.config.max_peers,
            presence: self.config.presence,
            registry: PeerRegistry::new(),
            listener,
            commands: command_rx,
            conn_events_rx: conn_rx,
            conn_events_tx: conn_tx,
            established_rx,
            established_tx,
            events: self.event_handlers.clone(),
        };
        let handle = tokio::spawn(driver.run());

        *self.runtime.lock() = Some(Runtime {
            commands: command_tx,
            local_addr,
            driver: handle,
        });
        *self.state.write() = SessionState::Running;

        tracing::info!(%local_addr, username = %self.username, "session started");
        self.event_handlers.dispatch(Event::SessionStarted { local_addr });
        Ok(())
    }

    /// Stop the session gracefully
    ///
    /// Sends a best-effort disconnect notice to every connected peer,
    /// closes all connections, and waits for the driver to finish.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotRunning` if the session is not running.
    pub async fn stop(&mut self) -> crate::Result<()> {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return Err(SessionError::NotRunning.into());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if runtime
            .commands
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        let _ = runtime.driver.await;

        *self.state.write() = SessionState::Stopped;
        self.event_handlers.dispatch(Event::SessionStopped);
        Ok(())
    }

    /// Get the current operational state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Username this session announces to peers
    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Address the session is listening on, once started
    ///
    /// Share this with other peers so they can connect.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.local_addr)
    }

    // ========================================================================
    // Event system
    // ========================================================================

    /// Register an event handler
    ///
    /// The handler will be called for all events until unsubscribed.
    pub fn on_event<F>(&mut self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.event_handlers.subscribe(handler)
    }

    /// Unsubscribe an event handler
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        self.event_handlers.unsubscribe(handle);
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    /// Connect to a peer at a known address
    ///
    /// Performs the handshake and registers the peer as Online. Returns the
    /// username the peer announced; by the time this returns, the peer is
    /// in the registry and can be messaged.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotRunning` if the session is not running
    /// - `NetworkError::ConnectionFailed` if the dial fails
    /// - `NetworkError::HandshakeTimeout` if the peer does not identify
    ///   itself in time
    pub async fn connect_to(&self, address: SocketAddr) -> crate::Result<Username> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Connect {
            address,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ChatError::from(SessionError::NotRunning))?
    }

    /// Send a chat message to a peer
    ///
    /// Resolves once the message is queued on the peer's connection;
    /// awaiting each call before issuing the next preserves delivery
    /// order. A slow peer delays only its own senders.
    ///
    /// # Errors
    ///
    /// - `SessionError::PeerUnknown` if `to` was never registered
    /// - `SessionError::PeerOffline` if the peer has no live connection
    ///
    /// In either case no bytes are written to any connection.
    pub async fn send_chat(&self, to: &str, body: impl Into<String>) -> crate::Result<()> {
        let to = Username::new(to)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::SendChat {
            to,
            body: body.into(),
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ChatError::from(SessionError::NotRunning))?
    }

    /// Disconnect from a peer
    ///
    /// Closes the connection if one is live and marks the peer Offline; the
    /// registry reflects the change before this returns. The record is kept
    /// so the peer can be reconnected later.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PeerUnknown` if the peer was never registered.
    pub async fn disconnect(&self, username: &str) -> crate::Result<()> {
        let username = Username::new(username)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Disconnect {
            username,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ChatError::from(SessionError::NotRunning))?
    }

    /// Remove a peer from the registry entirely
    ///
    /// Disconnects first if needed. This is the only way a record leaves
    /// the registry; peers are never garbage-collected implicitly.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PeerUnknown` if the peer was never registered.
    pub async fn forget_peer(&self, username: &str) -> crate::Result<()> {
        let username = Username::new(username)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Forget {
            username,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ChatError::from(SessionError::NotRunning))?
    }

    /// Get an ordered snapshot of every known peer
    ///
    /// Sorted by username for deterministic display. Taking a snapshot
    /// never blocks connection I/O.
    pub async fn list_peers(&self) -> crate::Result<Vec<PeerInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::ListPeers { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| ChatError::from(SessionError::NotRunning))
    }

    async fn send_command(&self, command: Command) -> crate::Result<()> {
        let sender = self
            .runtime
            .lock()
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(SessionError::NotRunning)?;
        sender
            .send(command)
            .await
            .map_err(|_| SessionError::NotRunning.into())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped running session must not leak its driver task.
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.driver.abort();
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Requests from the session handle to the driver task
enum Command {
    Connect {
        address: SocketAddr,
        reply: oneshot::Sender<crate::Result<Username>>,
    },
    SendChat {
        to: Username,
        body: String,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    Disconnect {
        username: Username,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    Forget {
        username: Username,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    ListPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Result of a completed handshake, inbound or outbound
struct Established {
    connection: PeerConnection,
    /// Acceptor port the peer advertised, when known
    advertised_port: Option<u16>,
    /// Caller waiting on `connect_to`, for outbound handshakes
    reply: Option<oneshot::Sender<crate::Result<Username>>>,
    /// Inbound handshakes are acked only after registration
    needs_ack: bool,
}

/// The serialized control path: sole owner of the peer registry
struct Driver {
    username: Username,
    advertised_port: u16,
    handshake_timeout: Duration,
    max_peers: usize,
    presence: PresencePolicy,
    registry: PeerRegistry,
    listener: ChatListener,
    commands: mpsc::Receiver<Command>,
    conn_events_rx: mpsc::Receiver<ConnectionEvent>,
    conn_events_tx: mpsc::Sender<ConnectionEvent>,
    established_rx: mpsc::Receiver<Established>,
    established_tx: mpsc::Sender<Established>,
    events: EventHandlers,
}

impl Driver {
    async fn run(mut self) {
        let mut heartbeat = match self.presence {
            PresencePolicy::Heartbeat { interval, .. } => Some(tokio::time::interval(interval)),
            PresencePolicy::Reactive => None,
        };

        // No branch below may wait on a connection's queue: one slow peer
        // must never park the serialized path for everyone else.
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => break,
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.conn_events_rx.recv() => {
                    self.handle_connection_event(event);
                }
                Some(established) = self.established_rx.recv() => {
                    self.handle_established(established);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_inbound_handshake(stream, peer_addr),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = tick(&mut heartbeat) => self.heartbeat_pass(),
            }
        }

        tracing::debug!("session driver stopped");
    }

    // ------------------------------------------------------------------
    // Connection establishment
    // ------------------------------------------------------------------

    fn spawn_inbound_handshake(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let handshake_timeout = self.handshake_timeout;
        let conn_tx = self.conn_events_tx.clone();
        let established_tx = self.established_tx.clone();

        tokio::spawn(async move {
            match PeerConnection::accept(stream, peer_addr, handshake_timeout, conn_tx).await {
                Ok((connection, advertised_port)) => {
                    let _ = established_tx
                        .send(Established {
                            connection,
                            advertised_port,
                            reply: None,
                            needs_ack: true,
                        })
                        .await;
                }
                // A failed inbound handshake drops the socket silently.
                Err(e) => {
                    tracing::debug!(address = %peer_addr, error = %e, "inbound handshake failed")
                }
            }
        });
    }

    fn spawn_outbound_handshake(
        &self,
        address: SocketAddr,
        reply: oneshot::Sender<crate::Result<Username>>,
    ) {
        let username = self.username.clone();
        let advertised_port = self.advertised_port;
        let handshake_timeout = self.handshake_timeout;
        let conn_tx = self.conn_events_tx.clone();
        let established_tx = self.established_tx.clone();

        tokio::spawn(async move {
            match PeerConnection::connect(
                address,
                username,
                advertised_port,
                handshake_timeout,
                conn_tx,
            )
            .await
            {
                Ok(connection) => {
                    // We dialed the peer's acceptor, so the dialed port is
                    // already the right one to record.
                    let _ = established_tx
                        .send(Established {
                            connection,
                            advertised_port: Some(address.port()),
                            reply: Some(reply),
                            needs_ack: false,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn handle_established(&mut self, established: Established) {
        let Established {
            connection,
            advertised_port,
            reply,
            needs_ack,
        } = established;
        let username = connection.username().clone();

        // A peer claiming our own name would alias our registry entry.
        if username == self.username {
            tracing::warn!(peer = %username, "rejecting connection claiming our username");
            connection.close();
            if let Some(reply) = reply {
                let _ = reply.send(Err(ProtocolError::UnexpectedMessage {
                    expected: "a distinct peer username".to_string(),
                    got: username.to_string(),
                }
                .into()));
            }
            return;
        }

        if self.registry.connected_count() >= self.max_peers
            && self.registry.connection(&username).is_none()
        {
            tracing::warn!(peer = %username, max = self.max_peers, "peer limit reached");
            connection.close();
            if let Some(reply) = reply {
                let _ = reply.send(Err(NetworkError::ConnectionFailed {
                    address: connection.peer_addr().to_string(),
                    reason: "peer limit reached".to_string(),
                }
                .into()));
            }
            return;
        }

        let record_addr = SocketAddr::new(
            connection.peer_addr().ip(),
            advertised_port.unwrap_or_else(|| connection.peer_addr().port()),
        );

        // A reconnect supersedes whatever connection was attached before.
        if let Some(old) = self.registry.take_connection(&username) {
            old.close();
        }

        self.registry.upsert(username.clone(), record_addr);

        if needs_ack {
            // The queue is fresh, so enqueueing cannot block the driver,
            // and FIFO keeps the ack the first frame the peer sees after
            // registration.
            if let Err(e) = connection.try_send(Message::connect_ack(self.username.clone())) {
                tracing::debug!(peer = %username, error = %e, "failed to ack handshake");
                connection.close();
                return;
            }
        }

        self.registry.attach_connection(&username, connection);
        self.registry.touch(&username);
        if self.registry.set_status(&username, PresenceStatus::Online) {
            self.events.dispatch(Event::PresenceChanged {
                username: username.clone(),
                status: PresenceStatus::Online,
            });
        }
        self.broadcast_presence(&username, PresenceStatus::Online);

        tracing::info!(peer = %username, address = %record_addr, "peer connected");
        if let Some(reply) = reply {
            let _ = reply.send(Ok(username));
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { address, reply } => self.spawn_outbound_handshake(address, reply),
            Command::SendChat { to, body, reply } => match self.chat_sender(&to) {
                // The capacity wait happens on a task of its own; a slow
                // peer parks only its own callers, never the driver.
                Ok(sender) => {
                    let message = Message::chat(self.username.clone(), body);
                    tokio::spawn(async move {
                        let _ = reply.send(sender.send(message).await);
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect { username, reply } => {
                let result = self.disconnect_peer(&username, true);
                let _ = reply.send(result);
            }
            Command::Forget { username, reply } => {
                let result = self.forget_peer(&username);
                let _ = reply.send(result);
            }
            Command::ListPeers { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            // Handled in the run loop
            Command::Shutdown { .. } => unreachable!("shutdown handled by run loop"),
        }
    }

    /// Resolve a chat target to its connection's detached sender
    fn chat_sender(&self, to: &Username) -> crate::Result<ConnectionSender> {
        if !self.registry.contains(to) {
            return Err(SessionError::PeerUnknown {
                username: to.to_string(),
            }
            .into());
        }

        let online = self.registry.status(to) == Some(PresenceStatus::Online);
        match self.registry.connection(to) {
            Some(connection) if online && !connection.is_closed() => Ok(connection.sender()),
            _ => Err(SessionError::PeerOffline {
                username: to.to_string(),
            }
            .into()),
        }
    }

    fn disconnect_peer(&mut self, username: &Username, notify_peer: bool) -> crate::Result<()> {
        if !self.registry.contains(username) {
            return Err(SessionError::PeerUnknown {
                username: username.to_string(),
            }
            .into());
        }

        if let Some(connection) = self.registry.take_connection(username) {
            if notify_peer {
                // Let the writer drain the notice before the close lands.
                connection.finish(Message::disconnect());
            } else {
                connection.close();
            }
        }
        self.mark_offline(username, None);
        Ok(())
    }

    fn forget_peer(&mut self, username: &Username) -> crate::Result<()> {
        self.disconnect_peer(username, true)?;
        self.registry.remove(username);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound traffic
    // ------------------------------------------------------------------

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Inbound { username, message } => {
                self.handle_inbound(username, message);
            }
            ConnectionEvent::Closed { username, reason } => {
                self.handle_closed(username, reason);
            }
        }
    }

    fn handle_inbound(&mut self, from: Username, message: Message) {
        self.registry.touch(&from);

        match message {
            Message::Chat {
                sender,
                body,
                timestamp,
            } => {
                self.events.dispatch(Event::ChatReceived {
                    from: sender,
                    body,
                    timestamp,
                });
            }
            Message::Presence { username, status } => {
                // Only the peer that observed the change originates the
                // broadcast; receivers update their registry and stop, so
                // presence can never relay in a loop.
                if self.registry.contains(&username) {
                    if self.registry.set_status(&username, status) {
                        self.events.dispatch(Event::PresenceChanged { username, status });
                    }
                } else {
                    tracing::debug!(peer = %username, "presence for unknown peer ignored");
                }
            }
            Message::Control {
                kind: ControlKind::Disconnect,
                ..
            } => {
                tracing::debug!(peer = %from, "peer sent disconnect");
                // Same path as a local disconnect, minus the echo.
                let _ = self.disconnect_peer(&from, false);
            }
            Message::Control {
                kind: ControlKind::Heartbeat,
                ..
            } => {
                if self.registry.set_status(&from, PresenceStatus::Online) {
                    self.events.dispatch(Event::PresenceChanged {
                        username: from,
                        status: PresenceStatus::Online,
                    });
                }
            }
            Message::Control { kind, .. } => {
                // Handshake control after establishment violates the
                // connection state machine.
                let reason = CloseReason::ProtocolViolation(format!(
                    "unexpected {:?} after handshake",
                    kind
                ));
                tracing::warn!(peer = %from, reason = %reason, "dropping connection");
                if let Some(connection) = self.registry.take_connection(&from) {
                    connection.close();
                }
                self.mark_offline(&from, Some(reason));
            }
        }
    }

    fn handle_closed(&mut self, username: Username, reason: CloseReason) {
        match self.registry.connection(&username) {
            // A fresh connection already superseded the one that closed.
            Some(connection) if !connection.is_closed() => return,
            Some(_) => {
                self.registry.take_connection(&username);
            }
            None => {}
        }

        tracing::debug!(peer = %username, reason = %reason, "connection closed");
        self.mark_offline(&username, Some(reason));
    }

    /// Flip a peer to Offline, emitting events and the presence broadcast
    /// only on an actual transition (duplicate closes are silent).
    fn mark_offline(&mut self, username: &Username, failure: Option<CloseReason>) {
        if self.registry.set_status(username, PresenceStatus::Offline) {
            if let Some(reason) = failure.filter(CloseReason::is_error) {
                self.events.dispatch(Event::ConnectionFailed {
                    username: username.clone(),
                    reason: reason.to_string(),
                });
            }
            self.events.dispatch(Event::PresenceChanged {
                username: username.clone(),
                status: PresenceStatus::Offline,
            });
            self.broadcast_presence(username, PresenceStatus::Offline);
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Tell every other connected peer about a status change we observed
    fn broadcast_presence(&self, about: &Username, status: PresenceStatus) {
        let notice = Message::presence(about.clone(), status);
        for (username, connection) in self.registry.iter_connected() {
            if username == about {
                continue;
            }
            if let Err(e) = connection.try_send(notice.clone()) {
                tracing::debug!(peer = %username, error = %e, "presence broadcast dropped");
            }
        }
    }

    fn heartbeat_pass(&mut self) {
        let keepalive = Message::heartbeat(self.username.clone());
        for (username, connection) in self.registry.iter_connected() {
            if let Err(e) = connection.try_send(keepalive.clone()) {
                tracing::debug!(peer = %username, error = %e, "heartbeat dropped");
            }
        }

        if let PresencePolicy::Heartbeat { idle_timeout, .. } = self.presence {
            for username in self.registry.stale(idle_timeout) {
                tracing::debug!(peer = %username, "peer silent past idle timeout");
                if let Some(connection) = self.registry.take_connection(&username) {
                    connection.close();
                }
                self.mark_offline(
                    &username,
                    Some(CloseReason::Transport("heartbeat timeout".to_string())),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn shutdown_all(&mut self) {
        for peer in self.registry.snapshot() {
            if let Some(connection) = self.registry.take_connection(&peer.username) {
                connection.finish(Message::disconnect());
            }
            self.registry.set_status(&peer.username, PresenceStatus::Offline);
        }
    }
}

async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
