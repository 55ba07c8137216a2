//! Peer registry: the single source of truth for known peers and presence
//!
//! The registry is exclusively owned by the session driver task; every
//! mutation happens on that serialized path, so it needs no locks and holds
//! none. It performs no network I/O. Records are removed only on explicit
//! user action, preserving the last known address for reconnection.

use crate::network::PeerConnection;
use crate::protocol::{PresenceStatus, Username};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Read-only view of a peer record, handed to the UI boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer's display name
    pub username: Username,
    /// Last known dialable address
    pub address: SocketAddr,
    /// Current presence
    pub status: PresenceStatus,
}

/// Everything the session knows about one peer
pub(crate) struct PeerRecord {
    pub(crate) username: Username,
    pub(crate) address: SocketAddr,
    pub(crate) status: PresenceStatus,
    /// Live connection, if any; owned by exactly this record
    pub(crate) connection: Option<PeerConnection>,
    /// Last traffic or keepalive observed, for the heartbeat policy
    pub(crate) last_seen: Option<Instant>,
}

impl PeerRecord {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            username: self.username.clone(),
            address: self.address,
            status: self.status,
        }
    }
}

/// Mapping from username to peer record
///
/// A `BTreeMap` keeps iteration ordered by username, which makes snapshots
/// deterministic for display.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: BTreeMap<Username, PeerRecord>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a peer or refresh an existing record's address
    ///
    /// New records start Offline; presence is a separate transition so the
    /// caller controls event emission.
    pub(crate) fn upsert(&mut self, username: Username, address: SocketAddr) {
        self.peers
            .entry(username.clone())
            .and_modify(|record| record.address = address)
            .or_insert(PeerRecord {
                username,
                address,
                status: PresenceStatus::Offline,
                connection: None,
                last_seen: None,
            });
    }

    /// Set a peer's presence
    ///
    /// Returns `true` only when the status actually changed; the driver uses
    /// this to emit exactly one presence event per transition, which makes
    /// duplicate offline notifications idempotent.
    pub(crate) fn set_status(&mut self, username: &Username, status: PresenceStatus) -> bool {
        match self.peers.get_mut(username) {
            Some(record) if record.status != status => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Attach a live connection to a peer record
    pub(crate) fn attach_connection(&mut self, username: &Username, connection: PeerConnection) {
        if let Some(record) = self.peers.get_mut(username) {
            record.connection = Some(connection);
        }
    }

    /// Detach and return a peer's connection, if any
    pub(crate) fn take_connection(&mut self, username: &Username) -> Option<PeerConnection> {
        self.peers
            .get_mut(username)
            .and_then(|record| record.connection.take())
    }

    /// Get a peer's live connection
    pub(crate) fn connection(&self, username: &Username) -> Option<&PeerConnection> {
        self.peers
            .get(username)
            .and_then(|record| record.connection.as_ref())
    }

    pub(crate) fn contains(&self, username: &Username) -> bool {
        self.peers.contains_key(username)
    }

    pub(crate) fn status(&self, username: &Username) -> Option<PresenceStatus> {
        self.peers.get(username).map(|record| record.status)
    }

    /// Record traffic from a peer for the heartbeat policy
    pub(crate) fn touch(&mut self, username: &Username) {
        if let Some(record) = self.peers.get_mut(username) {
            record.last_seen = Some(Instant::now());
        }
    }

    /// Online peers that have been silent longer than `idle_timeout`
    pub(crate) fn stale(&self, idle_timeout: Duration) -> Vec<Username> {
        self.peers
            .values()
            .filter(|record| {
                record.status == PresenceStatus::Online
                    && record
                        .last_seen
                        .map(|seen| seen.elapsed() > idle_timeout)
                        .unwrap_or(false)
            })
            .map(|record| record.username.clone())
            .collect()
    }

    /// Remove a peer entirely (explicit user action only)
    pub(crate) fn remove(&mut self, username: &Username) -> Option<PeerRecord> {
        self.peers.remove(username)
    }

    /// Iterate peers that currently have a live connection
    pub(crate) fn iter_connected(&self) -> impl Iterator<Item = (&Username, &PeerConnection)> {
        self.peers
            .iter()
            .filter_map(|(username, record)| record.connection.as_ref().map(|c| (username, c)))
    }

    /// Number of peers with a live connection
    pub(crate) fn connected_count(&self) -> usize {
        self.iter_connected().count()
    }

    /// Ordered, read-only view of every known peer
    pub(crate) fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.values().map(PeerRecord::info).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}
