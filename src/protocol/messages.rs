//! Wire message definitions
//!
//! Every message exchanged between peers is one of the variants of
//! [`Message`]. The payload encoding is a `"type"`-tagged JSON object so a
//! decoder can ignore unknown optional fields while rejecting unknown message
//! kinds outright.

use crate::error::ProtocolError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum username length in bytes
pub const MAX_USERNAME_LEN: usize = 64;

/// A validated peer display name
///
/// Usernames identify peers in the registry and on the wire. They are
/// non-empty and at most [`MAX_USERNAME_LEN`] bytes; validation happens on
/// construction and again when decoding, so a malformed name on the wire is
/// a decode error rather than a bad registry key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Create a username, validating length constraints
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidUsername` if the name is empty or
    /// longer than [`MAX_USERNAME_LEN`] bytes.
    pub fn new<S: Into<String>>(name: S) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidUsername {
                reason: "username must not be empty".to_string(),
            });
        }
        if name.len() > MAX_USERNAME_LEN {
            return Err(ProtocolError::InvalidUsername {
                reason: format!(
                    "username must be at most {} bytes, got {}",
                    MAX_USERNAME_LEN,
                    name.len()
                ),
            });
        }
        Ok(Self(name))
    }

    /// Get the username as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Username {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Username::new(raw).map_err(D::Error::custom)
    }
}

/// A peer's presence as observed by others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Peer has a live connection
    Online,
    /// Peer is known but not currently connected
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Discriminant for control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Opens the handshake; announces the connecting peer's username
    ConnectRequest,
    /// Accepts the handshake; announces the accepting peer's username
    ConnectAck,
    /// Peer is leaving; treated like a connection close at the remote end
    Disconnect,
    /// Keepalive used by the heartbeat presence policy
    Heartbeat,
}

/// Payload of a control message
///
/// All fields are optional at the wire level; which ones are required is
/// decided by the control kind. `listen_port` lets the connecting side
/// advertise its acceptor port so the remote end records a dialable address
/// instead of the ephemeral source port.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlPayload {
    /// Username of the peer the control message concerns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Username>,

    /// Listening port the sending peer accepts connections on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

/// A single wire message
///
/// Serialized as a JSON object tagged with `"type"`; see the module docs.
/// The decoder rejects unrecognized types with a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// A chat line from one user
    Chat {
        /// Username of the author
        sender: Username,
        /// Message text; may be empty
        body: String,
        /// Milliseconds since the Unix epoch at send time
        timestamp: i64,
    },

    /// A presence change notification
    ///
    /// Only the peer whose status changed (or the peer that directly
    /// observed the change on its own connection) originates these;
    /// receivers never relay them.
    Presence {
        /// Peer the status change concerns
        username: Username,
        /// New status
        status: PresenceStatus,
    },

    /// A session control message
    Control {
        /// What this control message does
        kind: ControlKind,
        /// Kind-specific fields
        payload: ControlPayload,
    },
}

impl Message {
    /// Build a chat message stamped with the current time
    pub fn chat(sender: Username, body: impl Into<String>) -> Self {
        Self::Chat {
            sender,
            body: body.into(),
            timestamp: current_timestamp_ms(),
        }
    }

    /// Build a presence notification
    pub fn presence(username: Username, status: PresenceStatus) -> Self {
        Self::Presence { username, status }
    }

    /// Build the handshake opener, announcing our username and acceptor port
    pub fn connect_request(username: Username, listen_port: u16) -> Self {
        Self::Control {
            kind: ControlKind::ConnectRequest,
            payload: ControlPayload {
                username: Some(username),
                listen_port: Some(listen_port),
            },
        }
    }

    /// Build the handshake reply, announcing the accepting peer's username
    pub fn connect_ack(username: Username) -> Self {
        Self::Control {
            kind: ControlKind::ConnectAck,
            payload: ControlPayload {
                username: Some(username),
                listen_port: None,
            },
        }
    }

    /// Build a disconnect notice
    pub fn disconnect() -> Self {
        Self::Control {
            kind: ControlKind::Disconnect,
            payload: ControlPayload::default(),
        }
    }

    /// Build a heartbeat keepalive
    pub fn heartbeat(username: Username) -> Self {
        Self::Control {
            kind: ControlKind::Heartbeat,
            payload: ControlPayload {
                username: Some(username),
                listen_port: None,
            },
        }
    }

    /// Short name of the variant, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Presence { .. } => "presence",
            Self::Control { .. } => "control",
        }
    }
}

/// Get the current timestamp in milliseconds since the Unix epoch
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_valid() {
        let name = Username::new("alice").unwrap();
        assert_eq!(name.as_str(), "alice");
        assert_eq!(name.to_string(), "alice");
    }

    #[test]
    fn test_username_empty_rejected() {
        let err = Username::new("").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUsername { .. }));
    }

    #[test]
    fn test_username_max_length() {
        let max = "a".repeat(MAX_USERNAME_LEN);
        assert!(Username::new(max.clone()).is_ok());

        let too_long = format!("{}b", max);
        assert!(Username::new(too_long).is_err());
    }

    #[test]
    fn test_username_ordering() {
        let alice = Username::new("alice").unwrap();
        let bob = Username::new("bob").unwrap();
        assert!(alice < bob);
    }

    #[test]
    fn test_username_wire_validation() {
        // A raw JSON string longer than the limit must fail to deserialize
        let long = format!("\"{}\"", "x".repeat(MAX_USERNAME_LEN + 1));
        let result: Result<Username, _> = serde_json::from_str(&long);
        assert!(result.is_err());
    }

    #[test]
    fn test_chat_message_json_shape() {
        let msg = Message::Chat {
            sender: Username::new("alice").unwrap(),
            body: "hi".to_string(),
            timestamp: 1234,
        };

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["body"], "hi");
        assert_eq!(json["timestamp"], 1234);
    }

    #[test]
    fn test_presence_message_json_shape() {
        let msg = Message::presence(Username::new("bob").unwrap(), PresenceStatus::Online);

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "presence");
        assert_eq!(json["username"], "bob");
        assert_eq!(json["status"], "online");
    }

    #[test]
    fn test_control_message_json_shape() {
        let msg = Message::connect_request(Username::new("bob").unwrap(), 9000);

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "control");
        assert_eq!(json["kind"], "connect_request");
        assert_eq!(json["payload"]["username"], "bob");
        assert_eq!(json["payload"]["listen_port"], 9000);
    }

    #[test]
    fn test_control_payload_optional_fields_omitted() {
        let msg = Message::disconnect();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("username"));
        assert!(!json.contains("listen_port"));
    }

    #[test]
    fn test_unknown_type_tag_rejected() {
        let raw = r#"{"type":"file_chunk","data":"..."}"#;
        let result: Result<Message, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_control_kind_rejected() {
        let raw = r#"{"type":"control","kind":"reboot","payload":{}}"#;
        let result: Result<Message, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_optional_field_ignored() {
        // A newer peer may attach fields this version does not know about
        let raw = r#"{"type":"presence","username":"bob","status":"online","since":12345}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            Message::presence(Username::new("bob").unwrap(), PresenceStatus::Online)
        );
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let raw = r#"{"type":"chat","sender":"alice","timestamp":1}"#;
        let result: Result<Message, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_current_timestamp_ms() {
        let ts = current_timestamp_ms();
        // Should be reasonable (after 2020)
        assert!(ts > 1577836800000);
    }

    #[test]
    fn test_kind_name() {
        assert_eq!(
            Message::chat(Username::new("a").unwrap(), "x").kind_name(),
            "chat"
        );
        assert_eq!(Message::disconnect().kind_name(), "control");
    }
}
