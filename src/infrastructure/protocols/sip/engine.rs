//! Signaling engine
//!
//! Turns one received datagram into the datagrams to send in response. The
//! engine owns no socket; the server feeds it messages one at a time in
//! arrival order and transmits whatever it returns.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::auth::DigestAuth;
use super::builder::{build_ack, build_bye, new_call_id, new_tag, RequestBuilder, ResponseBuilder};
use super::dialog::{
    CallState, Dialog, DialogOrigin, DialogTable, OriginateStage, OriginatedCall,
};
use super::message::{
    extract_contact_addr, extract_extension, SipMessage, SipMethod, StartLine,
};
use super::registrar::Registrar;
use super::sdp::{reserialize_message, rewrite_for_relay, SessionDescription};
use super::transport::OutgoingMessage;
use crate::config::SipConfig;
use crate::domain::shared::{DomainError, Result, SipUri};
use crate::infrastructure::media::relay::{MediaRelay, RelayEndpoint};

/// User part of the server's own Contact on originated calls
const SERVER_USER: &str = "siprelay";

/// One datagram as text for parsing and rewriting, and as the bytes that
/// arrived for verbatim forwarding
struct Received<'a> {
    text: &'a str,
    bytes: Bytes,
}

/// What one sweep reclaimed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub registrations: usize,
    pub unanswered_calls: usize,
    /// BYEs to parties already connected to a dropped originated call
    pub outgoing: Vec<OutgoingMessage>,
}

pub struct SignalingEngine {
    registrar: Arc<Registrar>,
    dialogs: Arc<DialogTable>,
    relay: Arc<MediaRelay>,
    auth: Option<DigestAuth>,
    domain: String,
    trust_contact_header: bool,
    ringing_timeout: Duration,
    /// Address placed in Via and Contact of requests the server originates
    local_addr: SocketAddr,
}

impl SignalingEngine {
    pub fn new(config: &SipConfig, relay: Arc<MediaRelay>, local_addr: SocketAddr) -> Self {
        let auth = config
            .auth
            .enabled
            .then(|| DigestAuth::with_users(&config.auth.realm, config.auth.users.clone()));

        Self {
            registrar: Arc::new(Registrar::new(config.default_expires, config.max_expires)),
            dialogs: Arc::new(DialogTable::new()),
            relay,
            auth,
            domain: config.domain.clone(),
            trust_contact_header: config.trust_contact_header,
            ringing_timeout: Duration::seconds(config.ringing_timeout_secs as i64),
            local_addr,
        }
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn dialogs(&self) -> &Arc<DialogTable> {
        &self.dialogs
    }

    pub fn relay(&self) -> &Arc<MediaRelay> {
        &self.relay
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Process one datagram from `source`
    pub async fn handle(&self, data: &[u8], source: SocketAddr) -> Vec<OutgoingMessage> {
        let raw = String::from_utf8_lossy(data);
        let message = SipMessage::parse(&raw);
        let datagram = Received {
            text: &raw,
            bytes: Bytes::copy_from_slice(data),
        };

        match message.start_line() {
            StartLine::Request { method, .. } => {
                debug!("Received {} from {}", method, source);
                match method {
                    SipMethod::Register => self.handle_register(&message, source).await,
                    SipMethod::Invite => self.handle_invite(&raw, &message, source).await,
                    SipMethod::Ack => self.handle_ack(&datagram, &message).await,
                    SipMethod::Bye => self.handle_bye(&datagram, &message, source).await,
                    other => {
                        info!("Ignoring unsupported {} from {}", other, source);
                        Vec::new()
                    }
                }
            }
            StartLine::Response { status, .. } => {
                debug!("Received {} response from {}", status, source);
                self.handle_response(&datagram, &message, *status, source).await
            }
            StartLine::Unknown(line) => {
                debug!("Dropping unparseable datagram from {}: {:?}", source, line);
                Vec::new()
            }
        }
    }

    /// Housekeeping run by the server's sweep task.
    ///
    /// Drops expired registrations and calls nobody answered in time.
    pub async fn sweep(&self) -> SweepReport {
        if let Some(auth) = &self.auth {
            auth.cleanup_nonces().await;
        }
        self.sweep_at(Utc::now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let registrations = self.registrar.sweep_expired(now).await;

        let unanswered = self
            .dialogs
            .remove_unanswered(now, self.ringing_timeout)
            .await;
        let mut outgoing = Vec::new();
        for dialog in &unanswered {
            self.relay.release(&dialog.call_id).await;
            if let DialogOrigin::Originated(call) = &dialog.origin {
                if let Some(answer) = &call.caller_answer {
                    let bye = build_bye(
                        &call.caller_invite,
                        answer,
                        self.local_addr,
                        next_cseq(&call.caller_invite),
                        false,
                    );
                    outgoing.push(OutgoingMessage::new(dialog.caller_signaling, &bye));
                }
            }
            info!(
                "Call {} ({} -> {}) unanswered after {}s, dropped",
                dialog.call_id,
                dialog.caller,
                dialog.callee,
                self.ringing_timeout.num_seconds()
            );
        }

        SweepReport {
            registrations,
            unanswered_calls: unanswered.len(),
            outgoing,
        }
    }

    async fn handle_register(&self, request: &SipMessage, source: SocketAddr) -> Vec<OutgoingMessage> {
        let Some(extension) = request
            .header("To")
            .and_then(extract_extension)
            .or_else(|| request.header("From").and_then(extract_extension))
        else {
            warn!("REGISTER from {} without extension, dropping", source);
            return Vec::new();
        };

        if let Some(auth) = &self.auth {
            if let Some(challenge) = self.authenticate(auth, request, &extension, source).await {
                return vec![OutgoingMessage::new(source, &challenge)];
            }
        }

        let contact_text = request.header("Contact").unwrap_or_default();
        let requested = request
            .header("Expires")
            .and_then(|v| v.parse().ok())
            .or_else(|| contact_expires(contact_text));
        let expires = self.registrar.effective_expires(requested);

        let response = if expires == 0 {
            self.registrar.unregister(&extension).await;
            ResponseBuilder::ok()
                .to_tag(new_tag())
                .received_from(source)
                .header("Expires", "0")
                .build_for_request(request)
        } else {
            let contact = if self.trust_contact_header {
                extract_contact_addr(contact_text).unwrap_or(source)
            } else {
                source
            };
            self.registrar
                .register(&extension, contact, contact_text, expires)
                .await;

            ResponseBuilder::ok()
                .to_tag(new_tag())
                .received_from(source)
                .header(
                    "Contact",
                    format!("<sip:{}@{}>;expires={}", extension, contact, expires),
                )
                .header("Expires", expires.to_string())
                .build_for_request(request)
        };

        vec![OutgoingMessage::new(source, &response)]
    }

    /// None when the request carries valid credentials, otherwise the 401 to send
    async fn authenticate(
        &self,
        auth: &DigestAuth,
        request: &SipMessage,
        extension: &str,
        source: SocketAddr,
    ) -> Option<SipMessage> {
        let has_credentials = request.header("Authorization").is_some()
            || request.header("Proxy-Authorization").is_some();

        if has_credentials {
            match auth.verify(request, "REGISTER").await {
                Ok(username) if username == extension => return None,
                Ok(username) => {
                    warn!("User {} tried to register extension {}", username, extension)
                }
                Err(e) => warn!("REGISTER for {} rejected: {}", extension, e),
            }
        } else {
            debug!("Challenging REGISTER for {}", extension);
        }

        let challenge = auth.create_challenge().await;
        Some(
            ResponseBuilder::unauthorized()
                .to_tag(new_tag())
                .received_from(source)
                .header("WWW-Authenticate", challenge.to_header_value())
                .build_for_request(request),
        )
    }

    async fn handle_invite(
        &self,
        raw: &str,
        request: &SipMessage,
        source: SocketAddr,
    ) -> Vec<OutgoingMessage> {
        let Some(call_id) = request.call_id() else {
            warn!("INVITE from {} without Call-ID, dropping", source);
            return Vec::new();
        };

        if let Some(existing) = self.dialogs.get(call_id).await {
            return self.reforward_invite(raw, request, &existing, source).await;
        }

        let Some(callee) = request.header("To").and_then(extract_extension).or_else(|| {
            request
                .request_uri()
                .and_then(|uri| SipUri::parse(uri).ok())
                .map(|uri| uri.user().to_string())
                .filter(|user| !user.is_empty())
        }) else {
            warn!("INVITE {} from {} has no target extension, dropping", call_id, source);
            return Vec::new();
        };
        let caller = request
            .header("From")
            .and_then(extract_extension)
            .unwrap_or_else(|| "unknown".to_string());

        let Some(registration) = self.registrar.lookup(&callee).await else {
            info!("INVITE {} -> {}: callee not registered", caller, callee);
            let response = ResponseBuilder::not_found()
                .to_tag(new_tag())
                .build_for_request(request);
            return vec![OutgoingMessage::new(source, &response)];
        };

        let offer = SessionDescription::parse(request.body());
        let caller_media = SocketAddr::new(source.ip(), offer.audio_port);

        let binding = match self
            .relay
            .allocate(
                call_id,
                RelayEndpoint {
                    username: caller.clone(),
                    addr: Some(caller_media),
                },
                RelayEndpoint {
                    username: callee.clone(),
                    addr: None,
                },
            )
            .await
        {
            Ok(binding) => binding,
            Err(e) => {
                error!("Relay allocation for call {} failed: {}", call_id, e);
                let response = ResponseBuilder::service_unavailable()
                    .to_tag(new_tag())
                    .build_for_request(request);
                return vec![OutgoingMessage::new(source, &response)];
            }
        };

        let dialog = Dialog {
            call_id: call_id.to_string(),
            caller: caller.clone(),
            callee: callee.clone(),
            caller_media: Some(caller_media),
            caller_signaling: source,
            callee_contact: registration.contact,
            offer: request.body().to_string(),
            state: CallState::Ringing,
            created_at: Utc::now(),
            origin: DialogOrigin::Proxied,
        };
        if !self.dialogs.insert(dialog).await {
            warn!("Call {} appeared concurrently, releasing relay", call_id);
            self.relay.release(call_id).await;
            return Vec::new();
        }

        let body = rewrite_for_relay(
            request.body(),
            binding.relay_port_a,
            self.relay.relay_address(),
        );
        info!(
            "Routing call {}: {} -> {} at {}",
            call_id, caller, callee, registration.contact
        );
        vec![OutgoingMessage::raw(
            registration.contact,
            reserialize_message(raw, &body),
        )]
    }

    /// INVITE for a Call-ID already in the table
    async fn reforward_invite(
        &self,
        raw: &str,
        request: &SipMessage,
        dialog: &Dialog,
        source: SocketAddr,
    ) -> Vec<OutgoingMessage> {
        if dialog.is_originated() || source != dialog.caller_signaling {
            debug!("Ignoring INVITE for existing call {} from {}", dialog.call_id, source);
            return Vec::new();
        }
        let Some(binding) = self.relay.binding(&dialog.call_id).await else {
            return Vec::new();
        };

        debug!("Re-forwarding retransmitted INVITE for call {}", dialog.call_id);
        let body = rewrite_for_relay(
            request.body(),
            binding.relay_port_a,
            self.relay.relay_address(),
        );
        vec![OutgoingMessage::raw(
            dialog.callee_contact,
            reserialize_message(raw, &body),
        )]
    }

    async fn handle_ack(&self, datagram: &Received<'_>, request: &SipMessage) -> Vec<OutgoingMessage> {
        let Some(call_id) = request.call_id() else {
            return Vec::new();
        };

        match self.dialogs.get(call_id).await {
            Some(dialog) if !dialog.is_originated() => {
                vec![OutgoingMessage::raw(dialog.callee_contact, datagram.bytes.clone())]
            }
            Some(_) => Vec::new(),
            None => {
                debug!("ACK for unknown call {}", call_id);
                Vec::new()
            }
        }
    }

    async fn handle_bye(
        &self,
        datagram: &Received<'_>,
        request: &SipMessage,
        source: SocketAddr,
    ) -> Vec<OutgoingMessage> {
        let Some(call_id) = request.call_id() else {
            warn!("BYE from {} without Call-ID, dropping", source);
            return Vec::new();
        };

        let ok = ResponseBuilder::ok().build_for_request(request);
        let mut out = vec![OutgoingMessage::new(source, &ok)];

        let Some(dialog) = self.dialogs.get(call_id).await else {
            debug!("BYE for unknown call {}", call_id);
            return out;
        };
        let Some(peer) = dialog.peer_of(source) else {
            warn!("BYE for call {} from {}, not a party to it", call_id, source);
            return out;
        };

        self.relay.release(call_id).await;
        match &dialog.origin {
            DialogOrigin::Proxied => {
                out.push(OutgoingMessage::raw(peer, datagram.bytes.clone()));
            }
            DialogOrigin::Originated(call) => {
                if let Some(bye) = self.originated_bye(&dialog, call, source) {
                    out.push(bye);
                }
            }
        }
        self.dialogs.remove(call_id).await;

        info!(
            "Call {} torn down ({} -> {})",
            call_id, dialog.caller, dialog.callee
        );
        out
    }

    /// BYE the server sends to the leg opposite `source` of an originated call
    fn originated_bye(
        &self,
        dialog: &Dialog,
        call: &OriginatedCall,
        source: SocketAddr,
    ) -> Option<OutgoingMessage> {
        let (invite, answer, destination) = if source == dialog.caller_signaling {
            (
                call.callee_invite.as_ref()?,
                call.callee_answer.as_ref()?,
                dialog.callee_contact,
            )
        } else {
            (
                &call.caller_invite,
                call.caller_answer.as_ref()?,
                dialog.caller_signaling,
            )
        };

        let bye = build_bye(invite, answer, self.local_addr, next_cseq(invite), false);
        Some(OutgoingMessage::new(destination, &bye))
    }

    async fn handle_response(
        &self,
        datagram: &Received<'_>,
        response: &SipMessage,
        status: u16,
        source: SocketAddr,
    ) -> Vec<OutgoingMessage> {
        let Some(call_id) = response.call_id() else {
            return Vec::new();
        };
        let Some(dialog) = self.dialogs.get(call_id).await else {
            debug!("{} response for unknown call {}", status, call_id);
            return Vec::new();
        };
        if !matches!(response.cseq(), Some((_, SipMethod::Invite))) {
            debug!("Ignoring {} to non-INVITE request in call {}", status, call_id);
            return Vec::new();
        }

        match dialog.origin.clone() {
            DialogOrigin::Proxied => {
                self.proxied_response(datagram, response, status, source, &dialog)
                    .await
            }
            DialogOrigin::Originated(call) => {
                self.originated_response(response, status, source, &dialog, *call)
                    .await
            }
        }
    }

    async fn proxied_response(
        &self,
        datagram: &Received<'_>,
        response: &SipMessage,
        status: u16,
        source: SocketAddr,
        dialog: &Dialog,
    ) -> Vec<OutgoingMessage> {
        let call_id = dialog.call_id.as_str();
        let caller = dialog.caller_signaling;

        match status {
            100..=199 => vec![OutgoingMessage::raw(caller, datagram.bytes.clone())],
            200..=299 => {
                self.dialogs
                    .update(call_id, |d| d.state = CallState::Active)
                    .await;

                if response.body().trim().is_empty() {
                    return vec![OutgoingMessage::raw(caller, datagram.bytes.clone())];
                }
                let Some(binding) = self.relay.binding(call_id).await else {
                    warn!("Call {} has no relay binding", call_id);
                    return vec![OutgoingMessage::raw(caller, datagram.bytes.clone())];
                };

                let answer = SessionDescription::parse(response.body());
                let callee_media = SocketAddr::new(source.ip(), answer.audio_port);
                self.relay.bind_endpoint_b(call_id, callee_media).await;

                let body = rewrite_for_relay(
                    response.body(),
                    binding.relay_port_b,
                    self.relay.relay_address(),
                );
                info!(
                    "Call {} active: {} <-> {} via relay ports {}/{}",
                    call_id,
                    dialog.caller,
                    dialog.callee,
                    binding.relay_port_a,
                    binding.relay_port_b
                );
                vec![OutgoingMessage::raw(
                    caller,
                    reserialize_message(datagram.text, &body),
                )]
            }
            _ => {
                self.teardown(call_id, CallState::Failed).await;
                info!("Call {} failed with {}", call_id, status);
                vec![OutgoingMessage::raw(caller, datagram.bytes.clone())]
            }
        }
    }

    async fn originated_response(
        &self,
        response: &SipMessage,
        status: u16,
        source: SocketAddr,
        dialog: &Dialog,
        call: OriginatedCall,
    ) -> Vec<OutgoingMessage> {
        let call_id = dialog.call_id.as_str();
        if (100..=199).contains(&status) {
            return Vec::new();
        }

        let answered = (200..=299).contains(&status);
        match (call.stage, answered) {
            (OriginateStage::CallingCaller, true) => {
                let answer = SessionDescription::parse(response.body());
                let caller_media = SocketAddr::new(source.ip(), answer.audio_port);
                self.relay.bind_endpoint_a(call_id, caller_media).await;

                let Some(binding) = self.relay.binding(call_id).await else {
                    return Vec::new();
                };
                let ack = build_ack(&call.caller_invite, response, self.local_addr);
                let invite = self.originate_invite(
                    &dialog.callee,
                    dialog.callee_contact,
                    &dialog.caller,
                    call_id,
                    binding.relay_port_a,
                );

                let caller_answer = response.clone();
                let callee_invite = invite.clone();
                self.dialogs
                    .update(call_id, move |d| {
                        d.caller_media = Some(caller_media);
                        if let DialogOrigin::Originated(c) = &mut d.origin {
                            c.stage = OriginateStage::CallingCallee;
                            c.caller_answer = Some(caller_answer);
                            c.callee_invite = Some(callee_invite);
                        }
                    })
                    .await;

                info!("Call {}: {} answered, calling {}", call_id, dialog.caller, dialog.callee);
                vec![
                    OutgoingMessage::new(source, &ack),
                    OutgoingMessage::new(dialog.callee_contact, &invite),
                ]
            }
            (OriginateStage::CallingCallee, true) => {
                let Some(invite) = call.callee_invite.as_ref() else {
                    return Vec::new();
                };
                let answer = SessionDescription::parse(response.body());
                self.relay
                    .bind_endpoint_b(call_id, SocketAddr::new(source.ip(), answer.audio_port))
                    .await;

                let callee_answer = response.clone();
                self.dialogs
                    .update(call_id, move |d| {
                        d.state = CallState::Active;
                        if let DialogOrigin::Originated(c) = &mut d.origin {
                            c.stage = OriginateStage::Connected;
                            c.callee_answer = Some(callee_answer);
                        }
                    })
                    .await;

                info!("Call {} active: {} <-> {}", call_id, dialog.caller, dialog.callee);
                vec![OutgoingMessage::new(
                    source,
                    &build_ack(invite, response, self.local_addr),
                )]
            }
            (OriginateStage::Connected, true) => {
                // Retransmitted 2xx; acknowledge again on the leg it came from
                let invite = if source == dialog.callee_contact {
                    call.callee_invite.as_ref()
                } else {
                    Some(&call.caller_invite)
                };
                invite
                    .map(|invite| {
                        OutgoingMessage::new(source, &build_ack(invite, response, self.local_addr))
                    })
                    .into_iter()
                    .collect()
            }
            (stage, false) => {
                let mut out = Vec::new();
                let failed_invite = match stage {
                    OriginateStage::CallingCaller => Some(&call.caller_invite),
                    _ => call.callee_invite.as_ref(),
                };
                if let Some(invite) = failed_invite {
                    out.push(OutgoingMessage::new(
                        source,
                        &build_ack(invite, response, self.local_addr),
                    ));
                }
                if stage != OriginateStage::CallingCaller {
                    if let Some(answer) = call.caller_answer.as_ref() {
                        let bye = build_bye(
                            &call.caller_invite,
                            answer,
                            self.local_addr,
                            next_cseq(&call.caller_invite),
                            false,
                        );
                        out.push(OutgoingMessage::new(dialog.caller_signaling, &bye));
                    }
                }

                self.teardown(call_id, CallState::Failed).await;
                info!("Call {} failed with {} ({:?})", call_id, status, stage);
                out
            }
        }
    }

    async fn teardown(&self, call_id: &str, state: CallState) {
        self.relay.release(call_id).await;
        if let Some(dialog) = self.dialogs.remove(call_id).await {
            debug!("Call {} {} -> {}", call_id, dialog.state, state);
        }
    }

    /// Start a server-originated call: ring `from`, then connect it to `to`.
    ///
    /// Returns the new Call-ID and the INVITE to send.
    pub async fn originate(&self, from: &str, to: &str) -> Result<(String, Vec<OutgoingMessage>)> {
        if from == to {
            return Err(DomainError::ValidationError(
                "cannot connect an extension to itself".to_string(),
            ));
        }
        let caller = self
            .registrar
            .lookup(from)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("extension {} is not registered", from)))?;
        let callee = self
            .registrar
            .lookup(to)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("extension {} is not registered", to)))?;

        let call_id = new_call_id(&self.local_addr.ip().to_string());
        let binding = self
            .relay
            .allocate(
                &call_id,
                RelayEndpoint {
                    username: from.to_string(),
                    addr: None,
                },
                RelayEndpoint {
                    username: to.to_string(),
                    addr: None,
                },
            )
            .await
            .map_err(|e| DomainError::Internal(e.to_string()))?;

        let invite =
            self.originate_invite(from, caller.contact, to, &call_id, binding.relay_port_b);
        let dialog = Dialog {
            call_id: call_id.clone(),
            caller: from.to_string(),
            callee: to.to_string(),
            caller_media: None,
            caller_signaling: caller.contact,
            callee_contact: callee.contact,
            offer: invite.body().to_string(),
            state: CallState::Ringing,
            created_at: Utc::now(),
            origin: DialogOrigin::Originated(Box::new(OriginatedCall {
                stage: OriginateStage::CallingCaller,
                caller_invite: invite.clone(),
                caller_answer: None,
                callee_invite: None,
                callee_answer: None,
            })),
        };
        if !self.dialogs.insert(dialog).await {
            self.relay.release(&call_id).await;
            return Err(DomainError::Internal(format!("call {} already exists", call_id)));
        }

        info!("Originating call {}: {} -> {}", call_id, from, to);
        Ok((call_id, vec![OutgoingMessage::new(caller.contact, &invite)]))
    }

    /// INVITE from the server to `target`, presenting `presented` as the calling party
    fn originate_invite(
        &self,
        target: &str,
        target_addr: SocketAddr,
        presented: &str,
        call_id: &str,
        relay_port: u16,
    ) -> SipMessage {
        RequestBuilder::new(SipMethod::Invite, format!("sip:{}@{}", target, target_addr))
            .via(self.local_addr)
            .from(&format!("sip:{}@{}", presented, self.domain), &new_tag())
            .to(&format!("sip:{}@{}", target, self.domain), None)
            .call_id(call_id)
            .cseq(1)
            .contact(SERVER_USER, self.local_addr)
            .sdp(SessionDescription::audio_offer(
                SERVER_USER,
                self.relay.relay_address(),
                relay_port,
            ))
            .build()
    }
}

/// `expires` parameter of a Contact value
fn contact_expires(contact: &str) -> Option<u32> {
    let params = contact.rsplit_once('>').map(|(_, p)| p).unwrap_or(contact);
    params
        .split(';')
        .find_map(|p| p.trim().strip_prefix("expires=")?.trim().parse().ok())
}

fn next_cseq(invite: &SipMessage) -> u32 {
    invite.cseq().map(|(n, _)| n + 1).unwrap_or(2)
}
