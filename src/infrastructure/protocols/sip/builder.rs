//! SIP message builder utilities

use super::message::{extract_tag, SipMessage, SipMethod};
use super::rport::add_rport_and_received;
use rand::Rng;
use std::net::SocketAddr;

/// RFC 3261 magic cookie for branch parameters
const BRANCH_COOKIE: &str = "z9hG4bK";

const USER_AGENT: &str = concat!("siprelay/", env!("CARGO_PKG_VERSION"));

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

pub fn new_branch() -> String {
    format!("{}{}", BRANCH_COOKIE, random_token(10))
}

pub fn new_tag() -> String {
    random_token(8)
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4().simple(), host)
}

fn random_token(len: usize) -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<(String, String)>,
    body: String,
    to_tag: Option<String>,
    received_from: Option<SocketAddr>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: String::new(),
            to_tag: None,
            received_from: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn service_unavailable() -> Self {
        Self::new(503)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    /// Tag added to To when the request's To has none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    /// Stamp rport/received onto the copied Via
    pub fn received_from(mut self, source: SocketAddr) -> Self {
        self.received_from = Some(source);
        self
    }

    pub fn build_for_request(self, request: &SipMessage) -> SipMessage {
        let mut response = SipMessage::response(self.status_code, reason_phrase(self.status_code));

        // Copy essential headers from request
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            let Some(value) = request.header(name) else {
                continue;
            };
            let value = match name {
                "Via" => match self.received_from {
                    Some(source) => add_rport_and_received(value, source),
                    None => value.to_string(),
                },
                "To" => match &self.to_tag {
                    Some(tag) if extract_tag(value).is_none() => format!("{};tag={}", value, tag),
                    _ => value.to_string(),
                },
                _ => value.to_string(),
            };
            response.set_header(name, value);
        }

        for (name, value) in self.headers {
            response.set_header(&name, value);
        }
        response.set_header("User-Agent", USER_AGENT);
        response.set_body(self.body);
        response
    }
}

/// Build a SIP request
pub struct RequestBuilder {
    message: SipMessage,
    method: SipMethod,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            message: SipMessage::request(method.clone(), uri),
            method,
        }
    }

    /// Via for a UDP request sent from `local`, with a fresh branch
    pub fn via(mut self, local: SocketAddr) -> Self {
        self.message.set_header(
            "Via",
            format!("SIP/2.0/UDP {};branch={};rport", local, new_branch()),
        );
        self
    }

    pub fn from(mut self, uri: &str, tag: &str) -> Self {
        self.message.set_header("From", format!("<{}>;tag={}", uri, tag));
        self
    }

    pub fn to(mut self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.message.set_header("To", value);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.message.set_header("Call-ID", call_id);
        self
    }

    pub fn cseq(mut self, seq: u32) -> Self {
        self.message
            .set_header("CSeq", format!("{} {}", seq, self.method));
        self
    }

    pub fn contact(mut self, user: &str, addr: SocketAddr) -> Self {
        self.message
            .set_header("Contact", format!("<sip:{}@{}>", user, addr));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.message.set_header(name, value);
        self
    }

    pub fn sdp(mut self, body: impl Into<String>) -> Self {
        self.message.set_header("Content-Type", "application/sdp");
        self.message.set_body(body);
        self
    }

    pub fn build(mut self) -> SipMessage {
        self.message.set_header("Max-Forwards", "70");
        self.message.set_header("User-Agent", USER_AGENT);
        self.message
    }
}

/// ACK for a 2xx to `invite`, sent from `local`
pub fn build_ack(invite: &SipMessage, response: &SipMessage, local: SocketAddr) -> SipMessage {
    let target = contact_uri(response);
    in_dialog_request(SipMethod::Ack, invite, response, target, local, None)
}

/// BYE within the dialog established by `invite` and its 2xx `response`.
///
/// `as_callee` targets the caller's Contact and swaps From and To, for the
/// party that received the INVITE.
pub fn build_bye(
    invite: &SipMessage,
    response: &SipMessage,
    local: SocketAddr,
    cseq: u32,
    as_callee: bool,
) -> SipMessage {
    let target = if as_callee {
        contact_uri(invite)
    } else {
        contact_uri(response)
    };
    let mut bye = in_dialog_request(SipMethod::Bye, invite, response, target, local, Some(cseq));
    if as_callee {
        let from = bye.header("From").unwrap_or_default().to_string();
        let to = bye.header("To").unwrap_or_default().to_string();
        bye.set_header("From", to);
        bye.set_header("To", from);
    }
    bye
}

/// `sip:` URI inside a message's Contact header
pub fn contact_uri(message: &SipMessage) -> Option<String> {
    let contact = message.header("Contact")?;
    let start = contact.find("sip:")?;
    let end = contact[start..]
        .find(|ch: char| ch == '>' || ch == ';')
        .map(|i| start + i)
        .unwrap_or(contact.len());
    Some(contact[start..end].to_string())
}

fn in_dialog_request(
    method: SipMethod,
    invite: &SipMessage,
    response: &SipMessage,
    target: Option<String>,
    local: SocketAddr,
    cseq: Option<u32>,
) -> SipMessage {
    let uri = target
        .or_else(|| invite.request_uri().map(str::to_string))
        .unwrap_or_default();

    let seq = cseq
        .or_else(|| invite.cseq().map(|(n, _)| n))
        .unwrap_or(1);

    let mut builder = RequestBuilder::new(method, uri).via(local).cseq(seq);
    for name in ["From", "Call-ID"] {
        if let Some(value) = invite.header(name) {
            builder = builder.header(name, value);
        }
    }
    if let Some(to) = response.header("To").or_else(|| invite.header("To")) {
        builder = builder.header("To", to);
    }
    builder.build()
}
