//! TCP acceptor for inbound peer connections

use crate::error::NetworkError;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// Listening socket a session accepts peers on
///
/// Binding happens at session creation; a bind failure is the only fatal
/// error of session startup. The bound address (with the actual port when
/// port 0 was requested) is exposed so the user can share it with peers.
#[derive(Debug)]
pub struct ChatListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl ChatListener {
    /// Bind the listening socket
    ///
    /// Port 0 selects an ephemeral port; read it back via
    /// [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::BindFailed` if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> crate::Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;

        let local_addr = inner.local_addr().map_err(|e| NetworkError::BindFailed {
            address: addr.to_string(),
            reason: format!("failed to read bound address: {}", e),
        })?;

        Ok(Self { inner, local_addr })
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> crate::Result<(TcpStream, SocketAddr)> {
        self.inner
            .accept()
            .await
            .map_err(|e| {
                NetworkError::ConnectionFailed {
                    address: self.local_addr.to_string(),
                    reason: format!("accept failed: {}", e),
                }
                .into()
            })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
