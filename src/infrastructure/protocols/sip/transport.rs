//! SIP transport layer - UDP

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65535;
const CHANNEL_CAPACITY: usize = 1000;

/// Datagram received on the signaling socket
#[derive(Debug, Clone)]
pub struct IncomingDatagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: SocketAddr,
    pub data: Bytes,
}

impl OutgoingMessage {
    pub fn new(destination: SocketAddr, message: &SipMessage) -> Self {
        Self {
            destination,
            data: message.to_bytes(),
        }
    }

    /// Send `data` as given, e.g. a datagram forwarded byte for byte
    pub fn raw(destination: SocketAddr, data: impl Into<Bytes>) -> Self {
        Self {
            destination,
            data: data.into(),
        }
    }

    /// Parse the payload back into a message
    pub fn message(&self) -> SipMessage {
        SipMessage::parse_bytes(&self.data)
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the signaling socket; failure here is fatal for the caller
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            SipError::TransportError(format!("Failed to bind UDP socket {}: {}", bind_addr, e))
        })?;
        let local_addr = socket.local_addr().map_err(|e| {
            SipError::TransportError(format!("Failed to read local address: {}", e))
        })?;

        info!("UDP transport listening on {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, message: &OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    /// Send each message in order; failures are logged and skipped
    pub async fn send_all(&self, messages: Vec<OutgoingMessage>) {
        for message in messages {
            if let Err(e) = self.send(&message).await {
                warn!("{} (destination {})", e, message.destination);
            }
        }
    }

    /// Start the receive loop; datagrams arrive on the returned channel in order
    pub fn spawn_receiver(&self, cancel: CancellationToken) -> mpsc::Receiver<IncomingDatagram> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let socket = self.socket.clone();
        let local_addr = self.local_addr;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((size, source)) => {
                            debug!("Received {} bytes from {} via UDP", size, source);
                            let datagram = IncomingDatagram {
                                data: Bytes::copy_from_slice(&buf[..size]),
                                source,
                            };
                            if tx.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // ICMP port unreachable surfaces here on some platforms
                            debug!("UDP receive error on {}: {}", local_addr, e);
                        }
                    }
                }
            }
            info!("UDP transport on {} stopped", local_addr);
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMethod;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let cancel = CancellationToken::new();
        let mut rx = b.spawn_receiver(cancel.clone());

        let message = SipMessage::request(SipMethod::Options, "sip:b")
            .with_header("Call-ID", "t1");
        a.send(&OutgoingMessage::new(b.local_addr(), &message))
            .await
            .unwrap();

        let datagram = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.source, a.local_addr());
        assert_eq!(SipMessage::parse_bytes(&datagram.data).call_id(), Some("t1"));

        cancel.cancel();
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_transport_error() {
        let first = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let result = UdpTransport::bind(first.local_addr()).await;
        assert!(matches!(result, Err(SipError::TransportError(_))));
    }
}
