//! Client agents registering and calling each other through a running server.

use siprelay::config::{ClientConfig, Config};
use siprelay::infrastructure::protocols::sip::auth::DigestAuth;
use siprelay::infrastructure::protocols::sip::builder::ResponseBuilder;
use siprelay::infrastructure::protocols::sip::SipMessage;
use siprelay::{ClientAgent, ClientEvent, SipServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn server_config(relay_base: u16) -> Config {
    let mut config = Config::default();
    config.sip.bind_address = "127.0.0.1".parse().unwrap();
    config.sip.bind_port = 0;
    config.media.bind_address = "127.0.0.1".parse().unwrap();
    config.media.relay_port_min = relay_base;
    config.media.relay_port_max = relay_base + 99;
    config
}

fn client_config(username: &str, server: SocketAddr) -> ClientConfig {
    ClientConfig {
        username: username.to_string(),
        password: "secret".to_string(),
        server_host: server.ip(),
        server_port: server.port(),
        register_timeout_ms: 2000,
        ..ClientConfig::default()
    }
}

/// Next event matching `want`, skipping others
async fn wait_for<F>(events: &mut mpsc::Receiver<ClientEvent>, want: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    loop {
        let event = timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed");
        if want(&event) {
            return event;
        }
    }
}

async fn registered_agent(
    username: &str,
    server: SocketAddr,
) -> (ClientAgent, mpsc::Receiver<ClientEvent>) {
    let (agent, mut events) = ClientAgent::start(client_config(username, server))
        .await
        .unwrap();
    agent.register().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Registered { .. })).await;
    (agent, events)
}

#[tokio::test]
async fn test_call_and_media_through_relay() {
    let server = SipServer::start(&server_config(34300)).await.unwrap();
    let (alice, mut alice_events) = registered_agent("100", server.local_addr()).await;
    let (bob, mut bob_events) = registered_agent("101", server.local_addr()).await;

    let call_id = alice.call("101").await.unwrap();

    let incoming = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::IncomingCall { .. })).await;
    assert_eq!(
        incoming,
        ClientEvent::IncomingCall {
            call_id: call_id.clone(),
            from: "100".to_string()
        }
    );
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::CallAnswered { .. })).await;
    assert_eq!(server.active_calls().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(alice.media_stats().await.packets_sent > 0);
    assert!(alice.media_stats().await.packets_received > 0);
    assert!(bob.media_stats().await.packets_received > 0);

    alice.hangup(&call_id).await.unwrap();
    let ended = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::CallEnded { .. })).await;
    assert_eq!(ended, ClientEvent::CallEnded { call_id });
    assert!(server.active_calls().await.is_empty());

    alice.stop().await;
    bob.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_call_to_unregistered_extension_fails() {
    let server = SipServer::start(&server_config(34400)).await.unwrap();
    let (alice, mut events) = registered_agent("100", server.local_addr()).await;

    let call_id = alice.call("555").await.unwrap();
    let failed = wait_for(&mut events, |e| matches!(e, ClientEvent::CallFailed { .. })).await;
    assert_eq!(failed, ClientEvent::CallFailed { call_id, status: 404 });

    alice.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_make_call_connects_both_parties() {
    let server = SipServer::start(&server_config(34500)).await.unwrap();
    let (alice, mut alice_events) = registered_agent("100", server.local_addr()).await;
    let (bob, mut bob_events) = registered_agent("101", server.local_addr()).await;

    let call_id = server.make_call("100", "101").await.unwrap();
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::CallAnswered { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::CallAnswered { .. })).await;

    let calls = server.active_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_id, call_id);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(alice.media_stats().await.packets_received > 0);
    assert!(bob.media_stats().await.packets_received > 0);

    // First party hangs up; the server ends the second leg
    alice.hangup(&call_id).await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::CallEnded { .. })).await;
    assert!(server.active_calls().await.is_empty());

    alice.stop().await;
    bob.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_registration_with_digest_auth() {
    let mut config = server_config(34600);
    config.sip.auth.enabled = true;
    config
        .sip
        .auth
        .users
        .insert("100".to_string(), "secret".to_string());
    let server = SipServer::start(&config).await.unwrap();

    let (good, _good_events) = registered_agent("100", server.local_addr()).await;
    assert_eq!(server.registrations().await.len(), 1);

    let mut wrong = client_config("100", server.local_addr());
    wrong.password = "wrong".to_string();
    let (bad, mut bad_events) = ClientAgent::start(wrong).await.unwrap();
    bad.register().await.unwrap();
    let event = wait_for(&mut bad_events, |e| {
        matches!(e, ClientEvent::AuthenticationFailed { .. })
    })
    .await;
    assert_eq!(event, ClientEvent::AuthenticationFailed { attempts: 4 });

    good.stop().await;
    bad.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_auth_retries_are_bounded() {
    // A registrar that challenges every request
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let auth = DigestAuth::new("siprelay");
    let (agent, mut events) = ClientAgent::start(client_config("100", fake.local_addr().unwrap()))
        .await
        .unwrap();
    agent.register().await.unwrap();

    let mut requests = 0;
    let mut buf = [0u8; 4096];
    loop {
        let received = timeout(Duration::from_millis(500), fake.recv_from(&mut buf)).await;
        let Ok(Ok((n, from))) = received else { break };
        requests += 1;

        let request = SipMessage::parse_bytes(&buf[..n]);
        if requests > 1 {
            assert!(request.header("Authorization").is_some());
        }
        let challenge = auth.create_challenge().await;
        let response = ResponseBuilder::unauthorized()
            .header("WWW-Authenticate", challenge.to_header_value())
            .build_for_request(&request);
        fake.send_to(&response.to_bytes(), from).await.unwrap();
    }

    assert_eq!(requests, 4);
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::AuthenticationFailed { .. })
    })
    .await;
    assert_eq!(event, ClientEvent::AuthenticationFailed { attempts: 4 });
    agent.stop().await;
}

#[tokio::test]
async fn test_proxy_challenge_answered_with_proxy_authorization() {
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let auth = DigestAuth::new("siprelay");
    auth.add_user("100", "secret").await;
    let (agent, mut events) = ClientAgent::start(client_config("100", fake.local_addr().unwrap()))
        .await
        .unwrap();
    agent.register().await.unwrap();

    let mut buf = [0u8; 4096];
    let (n, from) = timeout(Duration::from_secs(2), fake.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let first = SipMessage::parse_bytes(&buf[..n]);
    let challenge = auth.create_challenge().await;
    let response = ResponseBuilder::new(407)
        .header("Proxy-Authenticate", challenge.to_header_value())
        .build_for_request(&first);
    fake.send_to(&response.to_bytes(), from).await.unwrap();

    let (n, from) = timeout(Duration::from_secs(2), fake.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let retry = SipMessage::parse_bytes(&buf[..n]);
    assert!(retry.header("Proxy-Authorization").is_some());
    assert!(retry.header("Authorization").is_none());
    assert_eq!(auth.verify(&retry, "REGISTER").await.unwrap(), "100");

    let ok = ResponseBuilder::ok().build_for_request(&retry);
    fake.send_to(&ok.to_bytes(), from).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Registered { .. })).await;
    assert!(matches!(event, ClientEvent::Registered { .. }));
    agent.stop().await;
}

#[tokio::test]
async fn test_registration_timeout_against_silent_server() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut config = client_config("100", silent.local_addr().unwrap());
    config.register_timeout_ms = 300;

    let (agent, mut events) = ClientAgent::start(config).await.unwrap();
    agent.register().await.unwrap();
    let event = wait_for(&mut events, |_| true).await;
    assert_eq!(event, ClientEvent::RegistrationTimeout);
    agent.stop().await;
}
