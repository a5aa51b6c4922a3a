//! Cluster Transport
//!
//! Connector descriptions and TCP connection establishment for
//! inter-broker links. Framing lives in `cluster::protocol`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// An endpoint a peer broker can be reached at, with an optional backup.
///
/// Immutable value; equality is by address so a re-announced connector
/// refreshes liveness without being treated as a new peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorPair {
    /// Primary acceptor address
    pub address: SocketAddr,
    /// Backup acceptor address, tried when the primary is unreachable
    pub backup: Option<SocketAddr>,
}

impl ConnectorPair {
    /// Create a connector pair with no backup
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            backup: None,
        }
    }

    /// Create a connector pair with a backup address
    pub fn with_backup(address: SocketAddr, backup: SocketAddr) -> Self {
        Self {
            address,
            backup: Some(backup),
        }
    }
}

impl fmt::Display for ConnectorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backup {
            Some(backup) => write!(f, "{} (backup {})", self.address, backup),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Connect to a peer, trying the backup address if the primary fails.
///
/// Each attempt is bounded by `connect_timeout`.
pub async fn connect(pair: &ConnectorPair, connect_timeout: Duration) -> io::Result<TcpStream> {
    match connect_one(pair.address, connect_timeout).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            if let Some(backup) = pair.backup {
                debug!(
                    "Connect to {} failed ({}), trying backup {}",
                    pair.address, e, backup
                );
                connect_one(backup, connect_timeout).await
            } else {
                Err(e)
            }
        }
    }
}

async fn connect_one(addr: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_backup() {
        let pair = ConnectorPair::new("127.0.0.1:61616".parse().unwrap());
        assert_eq!(pair.to_string(), "127.0.0.1:61616");
    }

    #[test]
    fn test_display_with_backup() {
        let pair = ConnectorPair::with_backup(
            "127.0.0.1:61616".parse().unwrap(),
            "127.0.0.1:61617".parse().unwrap(),
        );
        assert_eq!(pair.to_string(), "127.0.0.1:61616 (backup 127.0.0.1:61617)");
    }

    #[tokio::test]
    async fn test_connect_falls_back_to_backup() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backup = listener.local_addr().unwrap();

        // Primary points at a port nothing listens on.
        let pair = ConnectorPair::with_backup("127.0.0.1:1".parse().unwrap(), backup);

        let stream = connect(&pair, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), backup);
    }
}
