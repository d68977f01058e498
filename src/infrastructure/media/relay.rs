//! RTP media relay
//!
//! Each call gets two relay ports. Port A is the caller leg: it is advertised
//! to the callee (endpoint B), which sends to it and receives the caller's
//! media from it. Port B is the callee leg and is advertised to the caller
//! (endpoint A). A packet arriving on either port is matched by its source
//! address against the call's endpoints and sent unmodified to the opposite
//! endpoint from the port that endpoint was told about.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::rtp::packet::parse_header;
use crate::config::MediaConfig;

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay ports exhausted (max {max})")]
    PortsExhausted { max: u16 },
    #[error("Failed to bind relay port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("Call {0} already has a relay binding")]
    Duplicate(String),
}

/// One party of a relayed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub username: String,
    /// Unknown until that party's session description has been seen
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBinding {
    pub call_id: String,
    pub endpoint_a: RelayEndpoint,
    pub endpoint_b: RelayEndpoint,
    /// Caller-leg port, advertised to endpoint B
    pub relay_port_a: u16,
    /// Callee-leg port, advertised to endpoint A
    pub relay_port_b: u16,
}

struct RelaySession {
    binding: RelayBinding,
    socket_a: Arc<UdpSocket>,
    socket_b: Arc<UdpSocket>,
    cancel: CancellationToken,
    legs: Vec<JoinHandle<()>>,
}

/// Relay port pairs: fresh pairs from a counter, then pairs given back at
/// teardown in release order
struct PortPool {
    next: u32,
    max: u16,
    released: VecDeque<(u16, u16)>,
}

impl PortPool {
    fn take(&mut self) -> Option<(u16, u16)> {
        let port_a = self.next;
        let port_b = port_a + 1;
        if port_b <= self.max as u32 {
            self.next = port_b + 1;
            return Some((port_a as u16, port_b as u16));
        }
        self.released.pop_front()
    }

    fn give_back(&mut self, pair: (u16, u16)) {
        self.released.push_back(pair);
    }
}

pub struct MediaRelay {
    relay_address: IpAddr,
    bind_address: IpAddr,
    port_max: u16,
    ports: Mutex<PortPool>,
    sessions: RwLock<HashMap<String, RelaySession>>,
    shutdown: CancellationToken,
}

impl MediaRelay {
    pub fn new(config: &MediaConfig) -> Arc<Self> {
        Arc::new(Self {
            relay_address: config.relay_address,
            bind_address: config.bind_address,
            port_max: config.relay_port_max,
            ports: Mutex::new(PortPool {
                next: config.relay_port_min as u32,
                max: config.relay_port_max,
                released: VecDeque::new(),
            }),
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address advertised in rewritten session descriptions
    pub fn relay_address(&self) -> IpAddr {
        self.relay_address
    }

    /// Allocate both relay ports for `call_id` and start forwarding.
    ///
    /// Unused ports are handed out first; once the range has been walked,
    /// pairs released at teardown are reused. A pair that fails to bind is
    /// dropped from the pool.
    pub async fn allocate(
        self: &Arc<Self>,
        call_id: &str,
        endpoint_a: RelayEndpoint,
        endpoint_b: RelayEndpoint,
    ) -> Result<RelayBinding, RelayError> {
        if self.sessions.read().await.contains_key(call_id) {
            return Err(RelayError::Duplicate(call_id.to_string()));
        }

        let pair = self.ports.lock().await.take();
        let Some((port_a, port_b)) = pair else {
            return Err(RelayError::PortsExhausted { max: self.port_max });
        };
        let socket_a = self.bind(port_a).await?;
        let socket_b = self.bind(port_b).await?;

        let binding = RelayBinding {
            call_id: call_id.to_string(),
            endpoint_a,
            endpoint_b,
            relay_port_a: port_a,
            relay_port_b: port_b,
        };

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(call_id) {
            drop(sessions);
            drop((socket_a, socket_b));
            self.ports.lock().await.give_back((port_a, port_b));
            return Err(RelayError::Duplicate(call_id.to_string()));
        }

        let cancel = self.shutdown.child_token();
        let legs = vec![
            self.spawn_leg(call_id, "a", socket_a.clone(), cancel.clone()),
            self.spawn_leg(call_id, "b", socket_b.clone(), cancel.clone()),
        ];
        sessions.insert(
            call_id.to_string(),
            RelaySession {
                binding: binding.clone(),
                socket_a,
                socket_b,
                cancel,
                legs,
            },
        );
        drop(sessions);

        info!(
            "Allocated relay for call {}: port A {}, port B {}",
            call_id, port_a, port_b
        );
        Ok(binding)
    }

    async fn bind(&self, port: u16) -> Result<Arc<UdpSocket>, RelayError> {
        UdpSocket::bind(SocketAddr::new(self.bind_address, port))
            .await
            .map(Arc::new)
            .map_err(|source| RelayError::Bind { port, source })
    }

    fn spawn_leg(
        self: &Arc<Self>,
        call_id: &str,
        leg: &'static str,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let relay: Weak<Self> = Arc::downgrade(self);
        let call_id = call_id.to_string();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, source) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                debug!("Relay leg {} of {} receive error: {}", leg, call_id, e);
                                continue;
                            }
                        };
                        let Some(relay) = relay.upgrade() else { break };
                        relay.forward(&call_id, &buf[..len], source).await;
                    }
                }
            }
            debug!("Relay leg {} of {} stopped", leg, call_id);
        })
    }

    async fn forward(&self, call_id: &str, packet: &[u8], source: SocketAddr) {
        if let Err(e) = parse_header(packet) {
            debug!("Dropping invalid media packet from {}: {}", source, e);
            return;
        }

        match self.route(call_id, source).await {
            Some((target, socket)) => {
                trace!("Relaying {} bytes {} -> {}", packet.len(), source, target);
                if let Err(e) = socket.send_to(packet, target).await {
                    warn!("Failed to relay media to {}: {}", target, e);
                }
            }
            None => debug!("Dropping media from unknown source {}", source),
        }
    }

    /// Destination and outgoing socket for a packet from `source` within one call.
    ///
    /// A's media leaves from port A, the port B was told to use, and B's media
    /// leaves from port B.
    async fn route(&self, call_id: &str, source: SocketAddr) -> Option<(SocketAddr, Arc<UdpSocket>)> {
        let sessions = self.sessions.read().await;
        let s = sessions.get(call_id)?;
        if s.binding.endpoint_a.addr == Some(source) {
            s.binding.endpoint_b.addr.map(|b| (b, s.socket_a.clone()))
        } else if s.binding.endpoint_b.addr == Some(source) {
            s.binding.endpoint_a.addr.map(|a| (a, s.socket_b.clone()))
        } else {
            None
        }
    }

    pub async fn bind_endpoint_a(&self, call_id: &str, addr: SocketAddr) -> bool {
        self.set_endpoint(call_id, addr, |b| &mut b.endpoint_a).await
    }

    pub async fn bind_endpoint_b(&self, call_id: &str, addr: SocketAddr) -> bool {
        self.set_endpoint(call_id, addr, |b| &mut b.endpoint_b).await
    }

    async fn set_endpoint(
        &self,
        call_id: &str,
        addr: SocketAddr,
        pick: impl FnOnce(&mut RelayBinding) -> &mut RelayEndpoint,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(call_id) {
            Some(session) => {
                let endpoint = pick(&mut session.binding);
                debug!(
                    "Call {}: endpoint {} bound to {}",
                    call_id, endpoint.username, addr
                );
                endpoint.addr = Some(addr);
                true
            }
            None => false,
        }
    }

    /// Stop forwarding for `call_id`, close its sockets and return its ports
    /// to the pool
    pub async fn release(&self, call_id: &str) -> Option<RelayBinding> {
        let RelaySession {
            binding,
            socket_a,
            socket_b,
            cancel,
            legs,
        } = self.sessions.write().await.remove(call_id)?;

        cancel.cancel();
        drop((socket_a, socket_b));
        for leg in legs {
            // Each leg holds a socket until it has finished
            if let Err(e) = leg.await {
                warn!("Relay leg of {} ended abnormally: {}", call_id, e);
            }
        }
        self.ports
            .lock()
            .await
            .give_back((binding.relay_port_a, binding.relay_port_b));

        info!(
            "Released relay for call {} (ports {}/{})",
            call_id, binding.relay_port_a, binding.relay_port_b
        );
        Some(binding)
    }

    pub async fn binding(&self, call_id: &str) -> Option<RelayBinding> {
        self.sessions
            .read()
            .await
            .get(call_id)
            .map(|s| s.binding.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Release every binding
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let released = {
            let mut sessions = self.sessions.write().await;
            let count = sessions.len();
            sessions.clear();
            count
        };
        if released > 0 {
            info!("Media relay stopped, {} bindings released", released);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::packet::{build_packet, RtpHeader};
    use std::time::Duration;
    use tokio::time::timeout;

    fn media_config(min: u16, max: u16) -> MediaConfig {
        MediaConfig {
            relay_address: "127.0.0.1".parse().unwrap(),
            bind_address: "127.0.0.1".parse().unwrap(),
            relay_port_min: min,
            relay_port_max: max,
        }
    }

    fn endpoint(username: &str, addr: Option<SocketAddr>) -> RelayEndpoint {
        RelayEndpoint {
            username: username.to_string(),
            addr,
        }
    }

    fn packet(seq: u16) -> bytes::Bytes {
        build_packet(&RtpHeader::new(0, seq, 160 * seq as u32, 0xAB), &[0x55; 160])
    }

    async fn recv(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 2048];
        match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_relay_symmetry() {
        let relay = MediaRelay::new(&media_config(31000, 31099));
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = relay
            .allocate(
                "call-1",
                endpoint("100", Some(a.local_addr().unwrap())),
                endpoint("101", None),
            )
            .await
            .unwrap();
        assert_eq!(binding.relay_port_a, 31000);
        assert_eq!(binding.relay_port_b, 31001);
        assert!(relay.bind_endpoint_b("call-1", b.local_addr().unwrap()).await);

        let port_a = SocketAddr::new("127.0.0.1".parse().unwrap(), binding.relay_port_a);
        let port_b = SocketAddr::new("127.0.0.1".parse().unwrap(), binding.relay_port_b);

        // A -> B, verbatim, arriving from the port B was told about
        let sent = packet(1);
        a.send_to(&sent, port_b).await.unwrap();
        let (data, from) = recv(&b).await.expect("B should receive");
        assert_eq!(data, sent.to_vec());
        assert_eq!(from, port_a);

        // B -> A
        let sent = packet(2);
        b.send_to(&sent, port_a).await.unwrap();
        let (data, from) = recv(&a).await.expect("A should receive");
        assert_eq!(data, sent.to_vec());
        assert_eq!(from, port_b);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_source_and_invalid_packets_dropped() {
        let relay = MediaRelay::new(&media_config(31100, 31199));
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = relay
            .allocate(
                "call-2",
                endpoint("100", Some(a.local_addr().unwrap())),
                endpoint("101", Some(b.local_addr().unwrap())),
            )
            .await
            .unwrap();
        let port_b = SocketAddr::new("127.0.0.1".parse().unwrap(), binding.relay_port_b);

        stranger.send_to(&packet(1), port_b).await.unwrap();
        assert!(recv(&b).await.is_none());

        a.send_to(&[0x80, 0x00, 0x01], port_b).await.unwrap();
        assert!(recv(&b).await.is_none());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_stops_forwarding() {
        let relay = MediaRelay::new(&media_config(31200, 31299));
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = relay
            .allocate(
                "call-3",
                endpoint("100", Some(a.local_addr().unwrap())),
                endpoint("101", Some(b.local_addr().unwrap())),
            )
            .await
            .unwrap();

        assert!(relay.release("call-3").await.is_some());
        assert!(relay.release("call-3").await.is_none());
        assert!(relay.binding("call-3").await.is_none());
        assert!(relay.is_empty().await);

        let port_b = SocketAddr::new("127.0.0.1".parse().unwrap(), binding.relay_port_b);
        a.send_to(&packet(1), port_b).await.ok();
        assert!(recv(&b).await.is_none());
    }

    #[tokio::test]
    async fn test_released_ports_are_reused_after_range_is_walked() {
        let relay = MediaRelay::new(&media_config(31300, 31303));
        let first = relay
            .allocate("c1", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        relay.release("c1").await;

        // Fresh ports come first
        let second = relay
            .allocate("c2", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        assert_eq!((first.relay_port_a, first.relay_port_b), (31300, 31301));
        assert_eq!((second.relay_port_a, second.relay_port_b), (31302, 31303));

        // Then the pair given back by the first call
        let third = relay
            .allocate("c3", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        assert_eq!((third.relay_port_a, third.relay_port_b), (31300, 31301));

        let fourth = relay
            .allocate("c4", endpoint("100", None), endpoint("101", None))
            .await;
        assert!(matches!(fourth, Err(RelayError::PortsExhausted { max: 31303 })));

        // Many calls through a one-pair range, each torn down before the next
        relay.shutdown().await;
        let small = MediaRelay::new(&media_config(31310, 31311));
        for i in 0..5 {
            let call_id = format!("loop-{}", i);
            let binding = small
                .allocate(&call_id, endpoint("100", None), endpoint("101", None))
                .await
                .unwrap();
            assert_eq!((binding.relay_port_a, binding.relay_port_b), (31310, 31311));
            assert!(small.release(&call_id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_duplicate_keeps_pool_intact() {
        let relay = MediaRelay::new(&media_config(31320, 31323));
        relay
            .allocate("dup", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        assert!(relay
            .allocate("dup", endpoint("100", None), endpoint("101", None))
            .await
            .is_err());

        // The rejected duplicate consumed no ports
        let next = relay
            .allocate("x", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        assert_eq!((next.relay_port_a, next.relay_port_b), (31322, 31323));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_call_id_rejected() {
        let relay = MediaRelay::new(&media_config(31400, 31499));
        relay
            .allocate("dup", endpoint("100", None), endpoint("101", None))
            .await
            .unwrap();
        let again = relay
            .allocate("dup", endpoint("100", None), endpoint("101", None))
            .await;
        assert!(matches!(again, Err(RelayError::Duplicate(_))));
        assert_eq!(relay.len().await, 1);
        relay.shutdown().await;
    }
}
