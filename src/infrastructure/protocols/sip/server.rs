//! SIP server
//!
//! Owns the signaling socket and the background tasks around the engine:
//! the receive loop and the periodic sweep.

use super::dialog::Dialog;
use super::engine::SignalingEngine;
use super::message::SipError;
use super::registrar::Registration;
use super::transport::UdpTransport;
use crate::config::Config;
use crate::domain::shared::Result;
use crate::infrastructure::media::relay::MediaRelay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct SipServer {
    engine: Arc<SignalingEngine>,
    transport: Arc<UdpTransport>,
    cancel: CancellationToken,
}

impl SipServer {
    /// Bind the signaling socket and start processing.
    ///
    /// A bind failure is returned as `SipError::TransportError`.
    pub async fn start(config: &Config) -> std::result::Result<Self, SipError> {
        info!("Starting SIP server");
        info!("Domain: {}", config.sip.domain);

        let transport = Arc::new(UdpTransport::bind(config.sip.bind_addr()).await?);
        let relay = MediaRelay::new(&config.media);

        let bound = transport.local_addr();
        let advertised_ip = if bound.ip().is_unspecified() {
            config.media.relay_address
        } else {
            bound.ip()
        };
        let engine = Arc::new(SignalingEngine::new(
            &config.sip,
            relay,
            SocketAddr::new(advertised_ip, bound.port()),
        ));

        let cancel = CancellationToken::new();
        Self::spawn_receive_loop(engine.clone(), transport.clone(), cancel.clone());
        Self::spawn_sweep(
            engine.clone(),
            transport.clone(),
            Duration::from_secs(config.sip.sweep_interval_secs),
            cancel.clone(),
        );

        info!(
            "SIP server started on {} (media relay at {}, ports {}-{})",
            bound,
            config.media.relay_address,
            config.media.relay_port_min,
            config.media.relay_port_max
        );
        Ok(Self {
            engine,
            transport,
            cancel,
        })
    }

    fn spawn_receive_loop(
        engine: Arc<SignalingEngine>,
        transport: Arc<UdpTransport>,
        cancel: CancellationToken,
    ) {
        let mut rx = transport.spawn_receiver(cancel.clone());
        tokio::spawn(async move {
            // One message at a time, in arrival order
            while let Some(datagram) = rx.recv().await {
                let out = engine.handle(&datagram.data, datagram.source).await;
                transport.send_all(out).await;
            }
            debug!("SIP receive loop finished");
        });
    }

    fn spawn_sweep(
        engine: Arc<SignalingEngine>,
        transport: Arc<UdpTransport>,
        every: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = engine.sweep().await;
                        if report.registrations > 0 || report.unanswered_calls > 0 {
                            info!(
                                "Swept {} expired registrations, {} unanswered calls",
                                report.registrations, report.unanswered_calls
                            );
                        }
                        transport.send_all(report.outgoing).await;
                    }
                }
            }
        });
    }

    /// Cancel background tasks and close every relay socket
    pub async fn stop(&self) {
        info!("Stopping SIP server");
        self.cancel.cancel();
        self.engine.relay().shutdown().await;
    }

    /// Address the signaling socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Server-originated call between two registered extensions
    pub async fn make_call(&self, from: &str, to: &str) -> Result<String> {
        let (call_id, out) = self.engine.originate(from, to).await?;
        self.transport.send_all(out).await;
        Ok(call_id)
    }

    pub async fn registrations(&self) -> Vec<Registration> {
        self.engine.registrar().registrations().await
    }

    pub async fn active_calls(&self) -> Vec<Dialog> {
        self.engine.dialogs().list().await
    }

    pub fn engine(&self) -> &Arc<SignalingEngine> {
        &self.engine
    }

    pub fn relay(&self) -> &Arc<MediaRelay> {
        self.engine.relay()
    }
}

impl Drop for SipServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::DomainError;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn test_config(relay_base: u16) -> Config {
        let mut config = Config::default();
        config.sip.bind_address = "127.0.0.1".parse().unwrap();
        config.sip.bind_port = 0;
        config.media.bind_address = "127.0.0.1".parse().unwrap();
        config.media.relay_port_min = relay_base;
        config.media.relay_port_max = relay_base + 99;
        config
    }

    #[tokio::test]
    async fn test_register_over_udp() {
        let server = SipServer::start(&test_config(33100)).await.unwrap();
        let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let register = "REGISTER sip:localhost SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bK1\r\n\
            From: <sip:100@localhost>;tag=1\r\n\
            To: <sip:100@localhost>\r\n\
            Call-ID: r1\r\n\
            CSeq: 1 REGISTER\r\n\
            Content-Length: 0\r\n\r\n";
        phone.send_to(register.as_bytes(), server.local_addr()).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(2), phone.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("SIP/2.0 200"));

        let registrations = server.registrations().await;
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].contact, phone.local_addr().unwrap());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_make_call_unregistered() {
        let server = SipServer::start(&test_config(33200)).await.unwrap();
        let result = server.make_call("100", "101").await;
        assert!(matches!(result, Err(DomainError::NotFound(_))));
        assert!(server.active_calls().await.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config(33300);
        config.sip.bind_port = taken.local_addr().unwrap().port();

        assert!(matches!(
            SipServer::start(&config).await,
            Err(SipError::TransportError(_))
        ));
    }
}
