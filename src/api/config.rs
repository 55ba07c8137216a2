//! Configuration types for chat sessions

use crate::error::ConfigError;
use crate::network::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::protocol::MAX_USERNAME_LEN;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// How a session decides that a peer has gone offline
///
/// Connection close always flips a peer to Offline; the heartbeat policy
/// additionally probes for peers whose process died without closing the
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePolicy {
    /// Offline only when a connection closes or errors (default)
    Reactive,

    /// Periodically send keepalives and expire silent peers
    Heartbeat {
        /// How often to send keepalives to every online peer
        interval: Duration,
        /// Silence threshold after which an online peer is marked Offline
        idle_timeout: Duration,
    },
}

impl Default for PresencePolicy {
    fn default() -> Self {
        Self::Reactive
    }
}

/// Complete session configuration
///
/// Instances are created via `SessionBuilder` and validated before use.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name announced to peers during the handshake
    pub username: String,

    /// Address to bind the listening socket to
    pub listen_addr: IpAddr,

    /// Port to listen on for incoming connections
    ///
    /// If set to 0, an ephemeral port will be selected.
    pub listen_port: u16,

    /// Deadline for the application-level handshake
    pub handshake_timeout: Duration,

    /// Maximum number of concurrently connected peers
    pub max_peers: usize,

    /// Presence detection policy
    pub presence: PresencePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 0,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_peers: 32,
            presence: PresencePolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if any check fails:
    /// - `username` must be non-empty and at most [`MAX_USERNAME_LEN`] bytes
    /// - `max_peers` must be greater than 0
    /// - heartbeat `interval` must be non-zero and shorter than
    ///   `idle_timeout`
    pub fn validate(&self) -> crate::Result<()> {
        if self.username.is_empty() {
            return Err(ConfigError::MissingRequiredField {
                field: "username".to_string(),
            }
            .into());
        }
        if self.username.len() > MAX_USERNAME_LEN {
            return Err(ConfigError::InvalidValue {
                field: "username".to_string(),
                reason: format!("must be at most {} bytes", MAX_USERNAME_LEN),
            }
            .into());
        }

        if self.max_peers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_peers".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if let PresencePolicy::Heartbeat {
            interval,
            idle_timeout,
        } = self.presence
        {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "presence.interval".to_string(),
                    reason: "must be non-zero".to_string(),
                }
                .into());
            }
            if idle_timeout <= interval {
                return Err(ConfigError::InvalidValue {
                    field: "presence.idle_timeout".to_string(),
                    reason: "must be longer than the heartbeat interval".to_string(),
                }
                .into());
            }
        }

        // Port 0 is valid (means ephemeral port)

        Ok(())
    }
}
