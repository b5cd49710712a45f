//! Datagram transport.
//!
//! Delivery is unordered, unreliable and at-most-once. The protocol adds no
//! acknowledgements of its own; lost requests are covered by the requester's
//! retry cadence. Closing a transport is dropping it.

use std::io;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::directory::Endpoint;
use crate::message::Message;

/// Receive buffer size. Protocol lines are far shorter than this.
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("failed to send to {endpoint}: {source}")]
    Send {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("truncated send to {endpoint}: {written} of {len} bytes")]
    Truncated {
        endpoint: Endpoint,
        written: usize,
        len: usize,
    },
    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),
}

/// A bound UDP socket owned by one node.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    local: Endpoint,
}

impl Transport {
    /// Binds `endpoint`. Port 0 picks an ephemeral port; [`Transport::local_addr`]
    /// reports the one actually bound.
    pub async fn bind(endpoint: Endpoint) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(endpoint)
            .await
            .map_err(|source| TransportError::Bind { endpoint, source })?;
        let local = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { endpoint, source })?;
        Ok(Self { socket, local })
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local
    }

    /// Encodes `message` and sends it as one datagram. A successful send says
    /// nothing about delivery.
    pub async fn send(&self, message: &Message, to: Endpoint) -> Result<(), TransportError> {
        self.send_bytes(message.encode().as_bytes(), to).await
    }

    /// Sends raw bytes as one datagram. A short write is an error.
    pub async fn send_bytes(&self, bytes: &[u8], to: Endpoint) -> Result<(), TransportError> {
        let written = self
            .socket
            .send_to(bytes, to)
            .await
            .map_err(|source| TransportError::Send {
                endpoint: to,
                source,
            })?;
        if written != bytes.len() {
            return Err(TransportError::Truncated {
                endpoint: to,
                written,
                len: bytes.len(),
            });
        }
        Ok(())
    }

    /// Waits for the next datagram. Cancel-safe, so it can sit in a `select!`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, Endpoint), TransportError> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(TransportError::Receive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NodeId;

    #[tokio::test]
    async fn delivers_encoded_lines() -> anyhow::Result<()> {
        let loopback: Endpoint = "127.0.0.1:0".parse()?;
        let sender = Transport::bind(loopback).await?;
        let receiver = Transport::bind(loopback).await?;

        sender
            .send(&Message::Request(NodeId::new(7)), receiver.local_addr())
            .await?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = receiver.recv(&mut buf).await?;
        assert_eq!(&buf[..len], b"REQUISICAO | 7");
        assert_eq!(from, sender.local_addr());
        Ok(())
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() -> anyhow::Result<()> {
        let first = Transport::bind("127.0.0.1:0".parse()?).await?;
        let err = Transport::bind(first.local_addr())
            .await
            .expect_err("port is already bound");
        assert!(matches!(err, TransportError::Bind { .. }));
        Ok(())
    }
}
