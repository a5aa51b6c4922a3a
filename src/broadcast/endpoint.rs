//! Broadcast Endpoints
//!
//! Send/receive of opaque payloads over a one-to-many channel. No
//! cluster semantics here; announcements are encoded one level up.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

/// Maximum announcement payload accepted from the channel
const MAX_BROADCAST_PAYLOAD: usize = 65536;

/// One-to-many byte channel
#[async_trait]
pub trait BroadcastEndpoint: Send + Sync {
    /// Send a payload to every listener on the channel
    async fn broadcast(&self, payload: &[u8]) -> io::Result<()>;

    /// Wait for the next payload from the channel
    async fn receive(&self) -> io::Result<Bytes>;
}

/// Produces endpoints for a configured channel, keeping broadcast and
/// discovery groups transport-agnostic
#[async_trait]
pub trait BroadcastEndpointFactory: Send + Sync {
    async fn create(&self) -> io::Result<Box<dyn BroadcastEndpoint>>;
}

/// IPv4 multicast endpoint.
///
/// A single socket bound to the group port with address reuse, joined to
/// the group, loopback enabled so nodes sharing a host hear each other.
pub struct UdpBroadcastEndpoint {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpBroadcastEndpoint {
    /// Bind and join the multicast group
    pub fn bind(group_address: Ipv4Addr, group_port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group_port);
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&group_address, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            group: SocketAddr::new(IpAddr::V4(group_address), group_port),
        })
    }
}

#[async_trait]
impl BroadcastEndpoint for UdpBroadcastEndpoint {
    async fn broadcast(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(payload, self.group).await?;
        Ok(())
    }

    async fn receive(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_BROADCAST_PAYLOAD];
        let (n, _) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Factory for the UDP multicast variant
#[derive(Debug, Clone)]
pub struct UdpBroadcastEndpointFactory {
    /// Multicast group address (e.g. 231.7.7.7)
    pub group_address: Ipv4Addr,
    /// Multicast group port
    pub group_port: u16,
}

#[async_trait]
impl BroadcastEndpointFactory for UdpBroadcastEndpointFactory {
    async fn create(&self) -> io::Result<Box<dyn BroadcastEndpoint>> {
        let endpoint = UdpBroadcastEndpoint::bind(self.group_address, self.group_port)?;
        Ok(Box::new(endpoint))
    }
}

/// In-process broadcast bus. Every endpoint created from one bus hears
/// every payload sent by any of them, including its own.
#[derive(Clone)]
pub struct LocalBroadcastBus {
    sender: broadcast::Sender<Bytes>,
}

impl LocalBroadcastBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Create an endpoint attached to this bus
    pub fn endpoint(&self) -> LocalBroadcastEndpoint {
        LocalBroadcastEndpoint {
            sender: self.sender.clone(),
            receiver: Mutex::new(self.sender.subscribe()),
        }
    }
}

impl Default for LocalBroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastEndpointFactory for LocalBroadcastBus {
    async fn create(&self) -> io::Result<Box<dyn BroadcastEndpoint>> {
        Ok(Box::new(self.endpoint()))
    }
}

/// Endpoint attached to a [`LocalBroadcastBus`]
pub struct LocalBroadcastEndpoint {
    sender: broadcast::Sender<Bytes>,
    receiver: Mutex<broadcast::Receiver<Bytes>>,
}

#[async_trait]
impl BroadcastEndpoint for LocalBroadcastEndpoint {
    async fn broadcast(&self, payload: &[u8]) -> io::Result<()> {
        self.sender
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "bus has no listeners"))?;
        Ok(())
    }

    async fn receive(&self) -> io::Result<Bytes> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Ok(payload),
                // Fell behind; skip to the most recent announcements.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_delivers_to_all_endpoints() {
        let bus = LocalBroadcastBus::new();
        let a = bus.endpoint();
        let b = bus.endpoint();

        a.broadcast(b"announce").await.unwrap();

        assert_eq!(a.receive().await.unwrap(), Bytes::from_static(b"announce"));
        assert_eq!(b.receive().await.unwrap(), Bytes::from_static(b"announce"));
    }

    #[tokio::test]
    async fn test_factory_creates_attached_endpoints() {
        let bus = LocalBroadcastBus::new();
        let listener = bus.create().await.unwrap();
        let sender = bus.create().await.unwrap();

        sender.broadcast(b"hello").await.unwrap();
        assert_eq!(
            listener.receive().await.unwrap(),
            Bytes::from_static(b"hello")
        );
    }
}
