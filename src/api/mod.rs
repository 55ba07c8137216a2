//! High-level API for confab
//!
//! This module provides the public-facing API that applications use to run
//! a chat session. The API is designed to be simple, type-safe, and
//! async-first.

pub mod config;
pub mod events;
pub mod registry;
pub mod session;

// Re-export main types for convenience
pub use config::{PresencePolicy, SessionConfig};
pub use events::{Event, EventHandlers, SubscriptionHandle};
pub use registry::PeerInfo;
pub use session::{Session, SessionBuilder, SessionState};
