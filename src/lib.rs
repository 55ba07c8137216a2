//! # Confab
//!
//! A session layer for peer-to-peer chat over TCP: length-prefixed framing,
//! a username-keyed peer registry, and presence propagation, behind an
//! event-driven API with no user interface of its own.
//!
//! ## Quick Start
//!
//! ```no_run
//! use confab::{Event, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = SessionBuilder::new()
//!         .with_username("alice")
//!         .with_listen_port(9000)
//!         .build()?;
//!
//!     session.on_event(|event| match event {
//!         Event::ChatReceived { from, body, .. } => println!("{}: {}", from, body),
//!         Event::PresenceChanged { username, status } => {
//!             println!("* {} is now {}", username, status)
//!         }
//!         _ => {}
//!     });
//!
//!     session.start().await?;
//!     let peer = session.connect_to("192.0.2.10:9000".parse()?).await?;
//!     session.send_chat(peer.as_str(), "hello").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod error;
pub mod network;
pub mod protocol;

// Re-export main types
pub use api::{
    Event, EventHandlers, PeerInfo, PresencePolicy, Session, SessionBuilder, SessionConfig,
    SessionState, SubscriptionHandle,
};
pub use error::{
    ChatError, ConfigError, NetworkError, ProtocolError, Result, SessionError,
};
pub use network::{CloseReason, ConnectionSender, ConnectionState, PeerConnection};
pub use protocol::{Message, PresenceStatus, Username};
