//! Shared UDP socket
//!
//! One socket per node, shared by the receive loop, the send paths and
//! the hole punchers. `UdpSocket` is already safe for concurrent sends;
//! this wrapper adds endpoint-string addressing and a stable handle type.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::info;

use omerta_core::parse_endpoint;

use crate::error::{NodeError, NodeResult};

/// Largest datagram we will receive
pub const MAX_DATAGRAM: usize = 65_536;

/// The node's UDP socket
pub struct MeshSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl MeshSocket {
    /// Bind to `0.0.0.0:port` (port 0 = ephemeral)
    pub async fn bind(port: u16) -> NodeResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NodeError::Io(format!("bind failed: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NodeError::Io(e.to_string()))?;

        info!(%local_addr, "Bound mesh socket");
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Send a datagram to a socket address
    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> NodeResult<()> {
        self.socket
            .send_to(bytes, addr)
            .await
            .map_err(|e| NodeError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Send a datagram to an endpoint string
    pub async fn send_to_endpoint(&self, bytes: &[u8], endpoint: &str) -> NodeResult<()> {
        let addr = parse_endpoint(endpoint)?;
        self.send_to(bytes, addr).await
    }

    /// Receive one datagram
    pub async fn recv_from(&self, buf: &mut [u8]) -> NodeResult<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| NodeError::Io(e.to_string()))
    }

    /// The bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound port
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The raw socket, for punch sessions
    pub fn udp(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_and_roundtrip() {
        let a = MeshSocket::bind(0).await.unwrap();
        let b = MeshSocket::bind(0).await.unwrap();
        assert_ne!(a.local_port(), 0);

        let target: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        a.send_to(b"hello", target).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from.port(), a.local_port());
    }

    #[tokio::test]
    async fn test_send_to_bad_endpoint() {
        let socket = MeshSocket::bind(0).await.unwrap();
        assert!(socket.send_to_endpoint(b"x", "not-an-endpoint").await.is_err());
        assert!(socket.send_to_endpoint(b"x", "127.0.0.1:0").await.is_err());
    }
}
