//! SIP user agent used by the `siprelay-client` binary and integration tests
//!
//! Registers one extension with the server, places and auto-answers calls,
//! and plays a tone (or silence) into every answered call. Digits queued
//! with [`ClientAgent::send_dtmf`] replace the audio as telephone-events
//! while they play. Outcomes are reported on an mpsc channel of
//! [`ClientEvent`].

use super::auth::AuthChallenge;
use super::builder::{
    build_ack, build_bye, new_call_id, new_tag, RequestBuilder, ResponseBuilder,
};
use super::message::{extract_extension, extract_tag, SipError, SipMessage, SipMethod, StartLine};
use super::rport::public_address;
use super::sdp::SessionDescription;
use super::transport::{OutgoingMessage, UdpTransport};
use crate::config::{AudioConfig, AudioMode, ClientConfig};
use crate::infrastructure::media::codec::dtmf::DEFAULT_VOLUME;
use crate::infrastructure::media::codec::{
    digit_to_event, event_payloads, TelephoneEvent, PCMU_PAYLOAD_TYPE,
    TELEPHONE_EVENT_PAYLOAD_TYPE,
};
use crate::infrastructure::media::generator::{AudioSource, ToneGenerator};
use crate::infrastructure::media::rtp::{parse_header, RtpSession, RtpStats, RTP_HEADER_SIZE};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const DTMF_CAPACITY: usize = 32;
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Something the agent wants its owner to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Registered { expires: u32 },
    RegistrationFailed { status: u16 },
    /// No final response within the registration timeout
    RegistrationTimeout,
    /// Credentials rejected after the configured number of retries
    AuthenticationFailed { attempts: u32 },
    IncomingCall { call_id: String, from: String },
    CallRinging { call_id: String },
    CallAnswered { call_id: String, remote_media: SocketAddr },
    CallFailed { call_id: String, status: u16 },
    CallEnded { call_id: String },
}

/// REGISTER transaction in progress
struct PendingRegistration {
    generation: u64,
    cseq: u32,
    auth_attempts: u32,
}

struct ClientCall {
    /// INVITE we sent, or the one we received
    invite: SipMessage,
    /// 2xx we received, or the one we sent
    answer: Option<SipMessage>,
    outgoing: bool,
    cseq: u32,
    auth_attempts: u32,
    media: Option<MediaHandle>,
}

/// Control side of a running media sender
struct MediaHandle {
    cancel: CancellationToken,
    /// Event codes waiting to be played
    dtmf: mpsc::Sender<u8>,
}

/// One digit being played as telephone-event packets
struct DigitPlayback {
    start: u32,
    payloads: std::vec::IntoIter<TelephoneEvent>,
    first: bool,
}

impl DigitPlayback {
    fn next_packet(&mut self, session: &mut RtpSession) -> Option<Bytes> {
        let payload = self.payloads.next()?;
        let marker = std::mem::replace(&mut self.first, false);
        Some(session.next_event_packet(
            TELEPHONE_EVENT_PAYLOAD_TYPE,
            self.start,
            marker,
            &payload.to_bytes(),
        ))
    }
}

#[derive(Default)]
struct AgentState {
    registration_call_id: String,
    from_tag: String,
    next_cseq: u32,
    generation: u64,
    pending: Option<PendingRegistration>,
    calls: HashMap<String, ClientCall>,
}

struct AgentInner {
    config: ClientConfig,
    transport: UdpTransport,
    rtp_socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    server: SocketAddr,
    events: mpsc::Sender<ClientEvent>,
    state: RwLock<AgentState>,
    stats: RwLock<RtpStats>,
    cancel: CancellationToken,
}

pub struct ClientAgent {
    inner: Arc<AgentInner>,
}

impl ClientAgent {
    /// Bind the signaling and media sockets and start listening
    pub async fn start(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), SipError> {
        let transport =
            UdpTransport::bind(SocketAddr::new(config.local_address, config.sip_port)).await?;
        let rtp_socket = UdpSocket::bind(SocketAddr::new(config.local_address, config.rtp_port))
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind RTP socket: {}", e)))?;
        let rtp_addr = rtp_socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))?;

        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let state = AgentState {
            registration_call_id: new_call_id(&config.local_address.to_string()),
            from_tag: new_tag(),
            next_cseq: 1,
            ..Default::default()
        };

        let inner = Arc::new(AgentInner {
            server: config.server_addr(),
            config,
            transport,
            rtp_socket: Arc::new(rtp_socket),
            rtp_addr,
            events,
            state: RwLock::new(state),
            stats: RwLock::new(RtpStats::default()),
            cancel: CancellationToken::new(),
        });

        AgentInner::spawn_signaling(inner.clone());
        AgentInner::spawn_media_receiver(inner.clone());

        info!(
            "Client {} listening on {} (media {})",
            inner.config.username,
            inner.transport.local_addr(),
            rtp_addr
        );
        Ok((Self { inner }, rx))
    }

    pub fn sip_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn rtp_addr(&self) -> SocketAddr {
        self.inner.rtp_addr
    }

    /// Send REGISTER; the outcome arrives as an event
    pub async fn register(&self) -> Result<(), SipError> {
        let inner = &self.inner;
        let (request, generation) = {
            let mut state = inner.state.write().await;
            state.generation += 1;
            let cseq = state.next_cseq;
            state.next_cseq += 1;
            state.pending = Some(PendingRegistration {
                generation: state.generation,
                cseq,
                auth_attempts: 0,
            });
            (inner.register_request(&state, cseq, None), state.generation)
        };

        inner.spawn_registration_timeout(generation);
        inner.send(&request).await
    }

    /// Call `extension` through the server, returning the new Call-ID
    pub async fn call(&self, extension: &str) -> Result<String, SipError> {
        let inner = &self.inner;
        let call_id = new_call_id(&inner.config.local_address.to_string());
        let invite = inner.invite_request(extension, &call_id, &new_tag(), 1, None);

        inner.state.write().await.calls.insert(
            call_id.clone(),
            ClientCall {
                invite: invite.clone(),
                answer: None,
                outgoing: true,
                cseq: 1,
                auth_attempts: 0,
                media: None,
            },
        );

        info!("Calling {} ({})", extension, call_id);
        inner.send(&invite).await?;
        Ok(call_id)
    }

    /// End a call; an answered call gets a BYE
    pub async fn hangup(&self, call_id: &str) -> Result<(), SipError> {
        let inner = &self.inner;
        let call = inner
            .state
            .write()
            .await
            .calls
            .remove(call_id)
            .ok_or_else(|| SipError::InvalidMessage(format!("No call {}", call_id)))?;

        if let Some(media) = &call.media {
            media.cancel.cancel();
        }
        if let Some(answer) = &call.answer {
            let bye = build_bye(
                &call.invite,
                answer,
                inner.transport.local_addr(),
                call.cseq + 1,
                !call.outgoing,
            );
            inner.send(&bye).await?;
        }

        info!("Hung up {}", call_id);
        inner.emit(ClientEvent::CallEnded {
            call_id: call_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Play `digit` (`0`-`9`, `*`, `#`, `A`-`D`) into an answered call.
    ///
    /// Digits queue behind one another; each interrupts the audio for
    /// `dtmf_duration_ms`.
    pub async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), SipError> {
        let event = digit_to_event(digit)
            .ok_or_else(|| SipError::InvalidMessage(format!("{:?} is not a DTMF digit", digit)))?;
        let dtmf = self
            .inner
            .state
            .read()
            .await
            .calls
            .get(call_id)
            .and_then(|call| call.media.as_ref())
            .map(|media| media.dtmf.clone())
            .ok_or_else(|| SipError::InvalidMessage(format!("No answered call {}", call_id)))?;

        dtmf.send(event)
            .await
            .map_err(|_| SipError::InvalidMessage(format!("Media for {} has stopped", call_id)))?;
        info!("DTMF {} queued on {}", digit, call_id);
        Ok(())
    }

    /// Counters for the media socket and every sender started so far
    pub async fn media_stats(&self) -> RtpStats {
        *self.inner.stats.read().await
    }

    /// Stop every task; in-progress calls are dropped without signaling
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let mut state = self.inner.state.write().await;
        state.pending = None;
        state.calls.clear();
        info!("Client {} stopped", self.inner.config.username);
    }
}

impl Drop for ClientAgent {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl AgentInner {
    fn aor(&self) -> String {
        format!("sip:{}@{}", self.config.username, self.config.domain)
    }

    fn register_request(
        &self,
        state: &AgentState,
        cseq: u32,
        credentials: Option<(&'static str, String)>,
    ) -> SipMessage {
        let aor = self.aor();
        let mut builder = RequestBuilder::new(SipMethod::Register, format!("sip:{}", self.config.domain))
            .via(self.transport.local_addr())
            .from(&aor, &state.from_tag)
            .to(&aor, None)
            .call_id(&state.registration_call_id)
            .cseq(cseq)
            .contact(&self.config.username, self.transport.local_addr())
            .header("Expires", self.config.expires.to_string());
        if let Some((name, value)) = credentials {
            builder = builder.header(name, value);
        }
        builder.build()
    }

    fn invite_request(
        &self,
        extension: &str,
        call_id: &str,
        tag: &str,
        cseq: u32,
        credentials: Option<(&'static str, String)>,
    ) -> SipMessage {
        let target = format!("sip:{}@{}", extension, self.config.domain);
        let mut builder = RequestBuilder::new(SipMethod::Invite, target.clone())
            .via(self.transport.local_addr())
            .from(&self.aor(), tag)
            .to(&target, None)
            .call_id(call_id)
            .cseq(cseq)
            .contact(&self.config.username, self.transport.local_addr())
            .sdp(self.local_offer());
        if let Some((name, value)) = credentials {
            builder = builder.header(name, value);
        }
        builder.build()
    }

    fn local_offer(&self) -> String {
        SessionDescription::audio_offer(
            &self.config.username,
            self.config.local_address,
            self.rtp_addr.port(),
        )
    }

    async fn send(&self, message: &SipMessage) -> Result<(), SipError> {
        self.transport
            .send(&OutgoingMessage::new(self.server, message))
            .await
    }

    async fn emit(&self, event: ClientEvent) {
        debug!("Client event: {:?}", event);
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn spawn_signaling(inner: Arc<Self>) {
        let mut rx = inner.transport.spawn_receiver(inner.cancel.clone());
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                let message = SipMessage::parse_bytes(&datagram.data);
                let result = match message.start_line() {
                    StartLine::Request { method, .. } => {
                        inner.handle_request(method.clone(), &message, datagram.source).await
                    }
                    StartLine::Response { status, .. } => {
                        inner.handle_response(*status, &message).await
                    }
                    StartLine::Unknown(_) => Ok(()),
                };
                if let Err(e) = result {
                    warn!("Client signaling error: {}", e);
                }
            }
        });
    }

    fn spawn_media_receiver(inner: Arc<Self>) {
        let socket = inner.rtp_socket.clone();
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => {
                        let Ok((size, source)) = received else { continue };
                        match parse_header(&buf[..size]) {
                            Ok(_) => {
                                let mut stats = inner.stats.write().await;
                                stats.packets_received += 1;
                                stats.bytes_received += (size - RTP_HEADER_SIZE) as u64;
                            }
                            Err(e) => debug!("Dropping media from {}: {}", source, e),
                        }
                    }
                }
            }
        });
    }

    fn spawn_registration_timeout(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        let wait = Duration::from_millis(self.config.register_timeout_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let timed_out = {
                        let mut state = inner.state.write().await;
                        match &state.pending {
                            Some(p) if p.generation == generation => {
                                state.pending = None;
                                true
                            }
                            _ => false,
                        }
                    };
                    if timed_out {
                        warn!("Registration of {} timed out", inner.config.username);
                        inner.emit(ClientEvent::RegistrationTimeout).await;
                    }
                }
            }
        });
    }

    /// Control handle for a media sender not yet started
    fn media_handle(&self) -> (MediaHandle, mpsc::Receiver<u8>) {
        let (dtmf, rx) = mpsc::channel(DTMF_CAPACITY);
        let handle = MediaHandle {
            cancel: self.cancel.child_token(),
            dtmf,
        };
        (handle, rx)
    }

    /// Send a frame to `remote` every 20 ms until `cancel` fires
    fn start_media(
        self: &Arc<Self>,
        remote: SocketAddr,
        cancel: CancellationToken,
        mut dtmf: mpsc::Receiver<u8>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut session = RtpSession::new(PCMU_PAYLOAD_TYPE);
            let mut generator = ToneGenerator::new(audio_source(&inner.config.audio));
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            let mut queued: VecDeque<u8> = VecDeque::new();
            let mut playing: Option<DigitPlayback> = None;
            debug!("Media to {} started (ssrc {:08x})", remote, session.ssrc());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = dtmf.recv() => queued.push_back(event),
                    _ = ticker.tick() => {
                        if playing.is_none() {
                            playing = queued.pop_front().map(|event| DigitPlayback {
                                start: session.timestamp(),
                                payloads: event_payloads(
                                    event,
                                    inner.config.dtmf_duration_ms,
                                    DEFAULT_VOLUME,
                                )
                                .into_iter(),
                                first: true,
                            });
                        }
                        let packet = match playing.as_mut().and_then(|p| p.next_packet(&mut session)) {
                            Some(packet) => packet,
                            None => {
                                playing = None;
                                session.next_packet(&generator.next_frame())
                            }
                        };
                        if let Err(e) = inner.rtp_socket.send_to(&packet, remote).await {
                            debug!("Media send to {} failed: {}", remote, e);
                            continue;
                        }
                        inner.stats.write().await.packets_sent += 1;
                    }
                }
            }
            debug!("Media to {} stopped after {} packets", remote, session.packets_sent());
        });
    }

    async fn handle_request(
        self: &Arc<Self>,
        method: SipMethod,
        request: &SipMessage,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        match method {
            SipMethod::Invite => self.handle_invite(request, source).await,
            SipMethod::Bye => self.handle_bye(request, source).await,
            SipMethod::Ack => Ok(()),
            other => {
                debug!("Ignoring {} from {}", other, source);
                Ok(())
            }
        }
    }

    async fn handle_invite(
        self: &Arc<Self>,
        request: &SipMessage,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?
            .to_string();
        let from = request
            .header("From")
            .and_then(extract_extension)
            .unwrap_or_default();

        // Retransmission: repeat the answer
        let previous = self
            .state
            .read()
            .await
            .calls
            .get(&call_id)
            .and_then(|c| c.answer.clone());
        if let Some(answer) = previous {
            return self
                .transport
                .send(&OutgoingMessage::new(source, &answer))
                .await;
        }

        self.emit(ClientEvent::IncomingCall {
            call_id: call_id.clone(),
            from: from.clone(),
        })
        .await;

        if !self.config.auto_answer {
            info!("Rejecting call {} from {}", call_id, from);
            let busy = ResponseBuilder::new(486)
                .to_tag(new_tag())
                .build_for_request(request);
            return self.transport.send(&OutgoingMessage::new(source, &busy)).await;
        }

        let answer = ResponseBuilder::ok()
            .to_tag(new_tag())
            .header(
                "Contact",
                format!("<sip:{}@{}>", self.config.username, self.transport.local_addr()),
            )
            .body("application/sdp", self.local_offer())
            .build_for_request(request);

        let remote = SessionDescription::parse(request.body()).media_addr();
        let (media, dtmf) = self.media_handle();
        let cancel = media.cancel.clone();
        self.state.write().await.calls.insert(
            call_id.clone(),
            ClientCall {
                invite: request.clone(),
                answer: Some(answer.clone()),
                outgoing: false,
                cseq: 0,
                auth_attempts: 0,
                media: Some(media),
            },
        );

        self.transport
            .send(&OutgoingMessage::new(source, &answer))
            .await?;
        self.start_media(remote, cancel, dtmf);

        info!("Answered call {} from {}", call_id, from);
        self.emit(ClientEvent::CallAnswered {
            call_id,
            remote_media: remote,
        })
        .await;
        Ok(())
    }

    async fn handle_bye(&self, request: &SipMessage, source: SocketAddr) -> Result<(), SipError> {
        let ok = ResponseBuilder::ok().build_for_request(request);
        self.transport.send(&OutgoingMessage::new(source, &ok)).await?;

        let Some(call_id) = request.call_id() else {
            return Ok(());
        };
        let removed = self.state.write().await.calls.remove(call_id);
        if let Some(call) = removed {
            if let Some(media) = call.media {
                media.cancel.cancel();
            }
            info!("Call {} ended by remote party", call_id);
            self.emit(ClientEvent::CallEnded {
                call_id: call_id.to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn handle_response(
        self: &Arc<Self>,
        status: u16,
        response: &SipMessage,
    ) -> Result<(), SipError> {
        match response.cseq() {
            Some((cseq, SipMethod::Register)) => self.handle_register_response(status, cseq, response).await,
            Some((_, SipMethod::Invite)) => self.handle_invite_response(status, response).await,
            _ => Ok(()),
        }
    }

    async fn handle_register_response(
        &self,
        status: u16,
        cseq: u32,
        response: &SipMessage,
    ) -> Result<(), SipError> {
        if status < 200 {
            return Ok(());
        }

        let mut state = self.state.write().await;
        match &state.pending {
            Some(pending) if pending.cseq == cseq => {}
            _ => {
                debug!("Stale REGISTER response {} (CSeq {})", status, cseq);
                return Ok(());
            }
        }

        if status == 401 || status == 407 {
            let Some(pending) = state.pending.as_mut() else {
                return Ok(());
            };
            pending.auth_attempts += 1;
            let attempts = pending.auth_attempts;
            if attempts > self.config.max_auth_attempts {
                state.pending = None;
                drop(state);
                warn!("Authentication for {} failed after {} attempts", self.config.username, attempts);
                self.emit(ClientEvent::AuthenticationFailed { attempts }).await;
                return Ok(());
            }

            let (challenge, header) = challenge_of(status, response)?;
            let authorization = challenge.authorization(
                &self.config.username,
                &self.config.password,
                "REGISTER",
                &format!("sip:{}", self.config.domain),
            );
            let cseq = state.next_cseq;
            state.next_cseq += 1;
            if let Some(pending) = state.pending.as_mut() {
                pending.cseq = cseq;
            }
            let request = self.register_request(&state, cseq, Some((header, authorization)));
            drop(state);

            debug!("Retrying REGISTER with credentials (attempt {})", attempts);
            return self.send(&request).await;
        }

        state.pending = None;
        drop(state);

        if (200..300).contains(&status) {
            let expires = response
                .header("Expires")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.config.expires);
            if let Some(public) = response.header("Via").and_then(public_address) {
                debug!("Server sees {} at {}", self.config.username, public);
            }
            info!("Registered {} for {}s", self.config.username, expires);
            self.emit(ClientEvent::Registered { expires }).await;
        } else {
            warn!("Registration of {} failed with {}", self.config.username, status);
            self.emit(ClientEvent::RegistrationFailed { status }).await;
        }
        Ok(())
    }

    async fn handle_invite_response(
        self: &Arc<Self>,
        status: u16,
        response: &SipMessage,
    ) -> Result<(), SipError> {
        let call_id = response.call_id().unwrap_or_default().to_string();
        let local = self.transport.local_addr();

        let mut state = self.state.write().await;
        let Some(call) = state.calls.get_mut(&call_id) else {
            return Ok(());
        };
        if !call.outgoing {
            return Ok(());
        }

        match status {
            100 => Ok(()),
            101..=199 => {
                drop(state);
                self.emit(ClientEvent::CallRinging { call_id }).await;
                Ok(())
            }
            200..=299 => {
                let ack = build_ack(&call.invite, response, local);
                if call.answer.is_some() {
                    drop(state);
                    return self.send(&ack).await;
                }

                let remote = SessionDescription::parse(response.body()).media_addr();
                let (media, dtmf) = self.media_handle();
                let cancel = media.cancel.clone();
                call.answer = Some(response.clone());
                call.media = Some(media);
                drop(state);

                self.send(&ack).await?;
                self.start_media(remote, cancel, dtmf);
                info!("Call {} answered, media to {}", call_id, remote);
                self.emit(ClientEvent::CallAnswered {
                    call_id,
                    remote_media: remote,
                })
                .await;
                Ok(())
            }
            401 | 407 => {
                let ack = build_ack(&call.invite, response, local);
                call.auth_attempts += 1;
                let attempts = call.auth_attempts;
                if attempts > self.config.max_auth_attempts {
                    state.calls.remove(&call_id);
                    drop(state);
                    self.send(&ack).await?;
                    self.emit(ClientEvent::AuthenticationFailed { attempts }).await;
                    return Ok(());
                }

                let extension = call
                    .invite
                    .header("To")
                    .and_then(extract_extension)
                    .unwrap_or_default();
                let tag = call
                    .invite
                    .header("From")
                    .and_then(extract_tag)
                    .unwrap_or_default()
                    .to_string();
                let uri = call.invite.request_uri().unwrap_or_default().to_string();
                let (challenge, header) = challenge_of(status, response)?;
                let authorization = challenge.authorization(
                    &self.config.username,
                    &self.config.password,
                    "INVITE",
                    &uri,
                );
                call.cseq += 1;
                let invite = self.invite_request(
                    &extension,
                    &call_id,
                    &tag,
                    call.cseq,
                    Some((header, authorization)),
                );
                call.invite = invite.clone();
                drop(state);

                self.send(&ack).await?;
                self.send(&invite).await
            }
            _ => {
                let ack = build_ack(&call.invite, response, local);
                state.calls.remove(&call_id);
                drop(state);

                self.send(&ack).await?;
                info!("Call {} failed with {}", call_id, status);
                self.emit(ClientEvent::CallFailed { call_id, status }).await;
                Ok(())
            }
        }
    }
}

fn audio_source(config: &AudioConfig) -> AudioSource {
    match config.mode {
        AudioMode::Tone => AudioSource::Tone {
            frequency: config.frequency,
            amplitude: config.amplitude,
        },
        AudioMode::Silence => AudioSource::Silence,
    }
}

/// Challenge carried by a 401/407 and the header that answers it
fn challenge_of(status: u16, response: &SipMessage) -> Result<(AuthChallenge, &'static str), SipError> {
    let (challenge, answer) = if status == 407 {
        ("Proxy-Authenticate", "Proxy-Authorization")
    } else {
        ("WWW-Authenticate", "Authorization")
    };
    let value = response
        .header(challenge)
        .ok_or_else(|| SipError::Authentication(format!("{} without {} header", status, challenge)))?;
    Ok((AuthChallenge::parse(value)?, answer))
}
