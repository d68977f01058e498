//! Two raw UDP endpoints (100 and 101) talking through a running server.

use siprelay::config::Config;
use siprelay::infrastructure::media::rtp::{build_packet, RtpHeader};
use siprelay::infrastructure::protocols::sip::builder::ResponseBuilder;
use siprelay::infrastructure::protocols::sip::{SessionDescription, SipMessage, SipMethod};
use siprelay::SipServer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn server_config(relay_base: u16) -> Config {
    let mut config = Config::default();
    config.sip.bind_address = "127.0.0.1".parse().unwrap();
    config.sip.bind_port = 0;
    config.media.bind_address = "127.0.0.1".parse().unwrap();
    config.media.relay_port_min = relay_base;
    config.media.relay_port_max = relay_base + 99;
    config
}

async fn recv_message(socket: &UdpSocket) -> SipMessage {
    let mut buf = [0u8; 4096];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for SIP message")
        .unwrap();
    SipMessage::parse_bytes(&buf[..n])
}

async fn send(socket: &UdpSocket, server: SocketAddr, text: &str) {
    socket.send_to(text.as_bytes(), server).await.unwrap();
}

async fn register(socket: &UdpSocket, server: SocketAddr, ext: &str) {
    let local = socket.local_addr().unwrap();
    let request = format!(
        "REGISTER sip:localhost SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKreg{ext}\r\n\
         From: <sip:{ext}@localhost>;tag=t{ext}\r\n\
         To: <sip:{ext}@localhost>\r\n\
         Call-ID: reg-{ext}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:{ext}@{local}>\r\n\
         Expires: 3600\r\n\
         Content-Length: 0\r\n\r\n"
    );
    send(socket, server, &request).await;
    assert_eq!(recv_message(socket).await.status_code(), Some(200));
}

fn invite(call_id: &str, to: &str, local: SocketAddr, media_port: u16) -> String {
    let sdp = SessionDescription::audio_offer("100", local.ip(), media_port);
    format!(
        "INVITE sip:{to}@localhost SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bK{call_id}\r\n\
         From: <sip:100@localhost>;tag=caller\r\n\
         To: <sip:{to}@localhost>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:100@{local}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    )
}

async fn recv_media(socket: &UdpSocket) -> Option<Vec<u8>> {
    let mut buf = [0u8; 2048];
    match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
        Ok(Ok((n, _))) => Some(buf[..n].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_call_between_two_extensions() {
    let server = SipServer::start(&server_config(34000)).await.unwrap();
    let server_addr = server.local_addr();

    let phone_100 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let phone_101 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let media_100 = UdpSocket::bind("127.0.0.1:12000").await.unwrap();
    let media_101 = UdpSocket::bind("127.0.0.1:13000").await.unwrap();

    register(&phone_100, server_addr, "100").await;
    register(&phone_101, server_addr, "101").await;
    assert_eq!(server.registrations().await.len(), 2);

    // Offer from 100 reaches 101 pointing at the relay
    let local_100 = phone_100.local_addr().unwrap();
    send(&phone_100, server_addr, &invite("call-1", "101", local_100, 12000)).await;
    let offer = recv_message(&phone_101).await;
    assert_eq!(offer.method(), Some(&SipMethod::Invite));
    let offered = SessionDescription::parse(offer.body());
    assert_eq!(offered.connection_address.to_string(), "127.0.0.1");
    assert_ne!(offered.audio_port, 12000);
    let relay_for_101 = offered.media_addr();

    // Answer from 101 reaches 100 pointing at the other relay port
    let answer_sdp = SessionDescription::audio_offer("101", "127.0.0.1".parse().unwrap(), 13000);
    let answer = ResponseBuilder::ok()
        .to_tag("callee")
        .body("application/sdp", answer_sdp)
        .build_for_request(&offer);
    phone_101.send_to(&answer.to_bytes(), server_addr).await.unwrap();
    let answered = recv_message(&phone_100).await;
    assert_eq!(answered.status_code(), Some(200));
    let relay_for_100 = SessionDescription::parse(answered.body()).media_addr();
    assert_ne!(relay_for_100.port(), relay_for_101.port());

    let calls = server.active_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].state.name(), "Active");

    // Media in both directions, delivered unchanged
    let from_100 = build_packet(&RtpHeader::new(0, 1, 160, 0x100), &[0xFF; 160]);
    media_100.send_to(&from_100, relay_for_100).await.unwrap();
    assert_eq!(recv_media(&media_101).await.as_deref(), Some(&from_100[..]));

    let from_101 = build_packet(&RtpHeader::new(0, 7, 320, 0x101), &[0x7F; 160]);
    media_101.send_to(&from_101, relay_for_101).await.unwrap();
    assert_eq!(recv_media(&media_100).await.as_deref(), Some(&from_101[..]));

    // A stranger's packets go nowhere
    let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    stranger.send_to(&from_100, relay_for_100).await.unwrap();
    assert!(recv_media(&media_101).await.is_none());

    // Hang up twice
    let bye = format!(
        "BYE sip:101@localhost SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local_100};branch=z9hG4bKbye\r\n\
         From: <sip:100@localhost>;tag=caller\r\n\
         To: <sip:101@localhost>;tag=callee\r\n\
         Call-ID: call-1\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n"
    );
    send(&phone_100, server_addr, &bye).await;
    assert_eq!(recv_message(&phone_100).await.status_code(), Some(200));
    assert_eq!(recv_message(&phone_101).await.method(), Some(&SipMethod::Bye));
    assert!(server.active_calls().await.is_empty());
    assert!(server.relay().is_empty().await);

    send(&phone_100, server_addr, &bye).await;
    assert_eq!(recv_message(&phone_100).await.status_code(), Some(200));

    // Relay sockets are gone
    media_100.send_to(&from_100, relay_for_100).await.unwrap();
    assert!(recv_media(&media_101).await.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_invite_to_unregistered_extension() {
    let server = SipServer::start(&server_config(34100)).await.unwrap();
    let server_addr = server.local_addr();

    let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    register(&phone, server_addr, "100").await;

    let local = phone.local_addr().unwrap();
    send(&phone, server_addr, &invite("call-404", "999", local, 12100)).await;
    assert_eq!(recv_message(&phone).await.status_code(), Some(404));

    // Exactly one response
    let mut buf = [0u8; 1024];
    assert!(timeout(Duration::from_millis(300), phone.recv_from(&mut buf))
        .await
        .is_err());
    assert!(server.active_calls().await.is_empty());
    assert!(server.relay().is_empty().await);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_datagrams_are_ignored() {
    let server = SipServer::start(&server_config(34200)).await.unwrap();
    let server_addr = server.local_addr();
    let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    phone.send_to(b"not sip at all", server_addr).await.unwrap();
    phone.send_to(&[0xFF, 0x00, 0x13], server_addr).await.unwrap();

    // Server still answers afterwards
    register(&phone, server_addr, "100").await;
    server.stop().await;
}
