//! Shared helpers for integration tests

use confab::{Event, PresenceStatus, Session, SessionBuilder, Username};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static TRACING: Once = Once::new();

/// Route session logs through the test harness, honoring RUST_LOG
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A started session plus a log of every event it dispatched
pub struct TestPeer {
    pub session: Session,
    pub events: Arc<Mutex<Vec<Event>>>,
}

/// Start a session on an ephemeral localhost port, recording its events
pub async fn start_peer(username: &str) -> TestPeer {
    init_tracing();

    let mut session = SessionBuilder::new()
        .with_username(username)
        .with_listen_addr("127.0.0.1".parse().unwrap())
        .with_listen_port(0)
        .build()
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.on_event(move |event| sink.lock().unwrap().push(event));

    session.start().await.unwrap();
    TestPeer { session, events }
}

impl TestPeer {
    pub fn addr(&self) -> SocketAddr {
        self.session.local_addr().unwrap()
    }

    /// Block until an event matching `predicate` has been dispatched
    ///
    /// Panics with the full event log if nothing matches within the limit.
    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if let Some(event) = self.events.lock().unwrap().iter().find(|e| predicate(e)) {
                return event.clone();
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {}; events so far: {:?}",
                    what,
                    self.events.lock().unwrap()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for a presence transition of `username` to `status`
    pub async fn wait_for_presence(&self, username: &str, status: PresenceStatus) {
        let expected = Username::new(username).unwrap();
        self.wait_for(
            &format!("presence {} {}", username, status),
            |event| {
                matches!(
                    event,
                    Event::PresenceChanged { username, status: s }
                        if *username == expected && *s == status
                )
            },
        )
        .await;
    }

    /// Count presence events recorded for `username` with `status`
    pub fn presence_count(&self, username: &str, status: PresenceStatus) -> usize {
        let expected = Username::new(username).unwrap();
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    Event::PresenceChanged { username, status: s }
                        if *username == expected && *s == status
                )
            })
            .count()
    }
}
