// transport.rs

use async_trait::async_trait;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error types for the transport layer
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout occurred")]
    Timeout,
    #[error("Transport not connected")]
    NotConnected,
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Trait defining the transport layer interface
///
/// A transport is one possible destination for drained pipeline output. It
/// abstracts the underlying communication mechanism so that real sockets and
/// mock implementations can be swapped in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send data to the peer
    ///
    /// # Arguments
    ///
    /// * `data` - The bytes to send
    async fn send(&self, data: &[u8]) -> Result<(), Error>;

    /// Receive data from the peer
    ///
    /// # Returns
    ///
    /// * `Result<usize, Error>` - Number of bytes received or error
    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, Error>;

    /// Set the default timeout for operations
    fn set_timeout(&mut self, timeout: Duration);
}

/// UDP transport; every `send` is one datagram to the configured peer.
pub struct UdpTransport {
    socket: Arc<tokio::net::UdpSocket>,
    remote_addr: Option<SocketAddr>,
    timeout: Duration,
}

impl UdpTransport {
    /// Create a new UDP transport bound to `local_addr`
    pub async fn new(local_addr: &str, remote_addr: Option<&str>) -> Result<Self, Error> {
        let socket = tokio::net::UdpSocket::bind(local_addr).await?;
        let remote = remote_addr
            .map(|addr| addr.parse())
            .transpose()
            .map_err(|e| Error::InvalidOperation(format!("Invalid address: {}", e)))?;

        Ok(Self {
            socket: Arc::new(socket),
            remote_addr: remote,
            timeout: Duration::from_secs(5),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: &[u8]) -> Result<(), Error> {
        let addr = self.remote_addr.ok_or(Error::NotConnected)?;
        match tokio::time::timeout(self.timeout, self.socket.send_to(data, addr)).await {
            Ok(Ok(sent)) => {
                debug!("UDP SEND: {} bytes to {}", sent, addr);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        match tokio::time::timeout(self.timeout, self.socket.recv_from(buffer)).await {
            Ok(Ok((bytes, _from))) => Ok(bytes),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_send_without_peer_fails() {
        let transport = UdpTransport::new("127.0.0.1:0", None).await.unwrap();
        let err = transport.send(&[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let mut receiver = UdpTransport::new("127.0.0.1:0", None).await.unwrap();
        receiver.set_timeout(Duration::from_secs(2));
        let receiver_addr = receiver.local_addr().unwrap().to_string();

        let sender = UdpTransport::new("127.0.0.1:0", Some(&receiver_addr)).await.unwrap();
        sender.send(&[10, 20, 30]).await.unwrap();

        let mut buffer = [0u8; 16];
        let received = receiver.receive(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..received], &[10, 20, 30]);
    }

    #[tokio::test]
    async fn test_invalid_remote_address() {
        let result = UdpTransport::new("127.0.0.1:0", Some("not-an-address")).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }
}
