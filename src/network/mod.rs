//! Network module
//!
//! TCP transport for peer sessions: the listening socket and the
//! per-peer connections with their framed I/O tasks.

mod connection;
mod listener;

pub use connection::{
    CloseReason, ConnectionEvent, ConnectionSender, ConnectionState, PeerConnection,
};
pub use listener::ChatListener;

use std::time::Duration;

/// Default deadline for the application-level handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of each connection's outbound message queue
///
/// Bounds how far a slow peer can fall behind before senders feel
/// backpressure.
pub(crate) const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// How long a finishing connection may keep draining queued frames before
/// it is closed regardless
pub(crate) const DISCONNECT_DRAIN_GRACE: Duration = Duration::from_secs(5);
