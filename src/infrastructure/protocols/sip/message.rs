//! SIP message types and parsing
//!
//! The parser never rejects input. Lines it cannot make sense of are skipped and an
//! unrecognisable start line is kept verbatim, so a misbehaving peer can at worst
//! get its datagram dropped by the caller.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::domain::shared::SipUri;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const CRLF: &str = "\r\n";

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Other(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Other(token) => token,
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTER" => SipMethod::Register,
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "CANCEL" => SipMethod::Cancel,
            "BYE" => SipMethod::Bye,
            "OPTIONS" => SipMethod::Options,
            other => SipMethod::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: SipMethod,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
    /// Anything that is neither a request line nor a status line
    Unknown(String),
}

impl StartLine {
    fn parse(line: &str) -> Self {
        let line = line.trim();

        if line.starts_with("SIP/") {
            let mut parts = line.splitn(3, ' ');
            let version = parts.next().unwrap_or_default();
            let status = parts.next().and_then(|s| s.parse::<u16>().ok());
            let reason = parts.next().unwrap_or_default();
            return match status {
                Some(status) if (100..=699).contains(&status) => StartLine::Response {
                    version: version.to_string(),
                    status,
                    reason: reason.to_string(),
                },
                _ => StartLine::Unknown(line.to_string()),
            };
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [method, uri, version]
                if version.starts_with("SIP/")
                    && method.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                StartLine::Request {
                    method: SipMethod::from_token(method),
                    uri: uri.to_string(),
                    version: version.to_string(),
                }
            }
            _ => StartLine::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                uri,
                version,
            } => write!(f, "{} {} {}", method, uri, version),
            StartLine::Response {
                version,
                status,
                reason,
            } => write!(f, "{} {} {}", version, status, reason),
            StartLine::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

/// A parsed SIP request or response
///
/// Headers keep their arrival order; a repeated header name overwrites the earlier
/// value in place. Names are compared case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    start_line: StartLine,
    headers: Vec<(String, String)>,
    body: String,
}

impl SipMessage {
    pub fn request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Request {
                method,
                uri: uri.into(),
                version: SIP_VERSION.to_string(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Self {
            start_line: StartLine::Response {
                version: SIP_VERSION.to_string(),
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let (head, body) = split_head_body(raw);

        let mut lines = head.lines();
        let start_line = StartLine::parse(lines.next().unwrap_or_default());

        let mut message = Self {
            start_line,
            headers: Vec::new(),
            body: body.to_string(),
        };

        for line in lines {
            let Some(colon) = line.find(':') else {
                continue;
            };
            if colon == 0 {
                continue;
            }
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if name.is_empty() {
                continue;
            }
            message.set_header(name, value);
        }

        message
    }

    pub fn parse_bytes(data: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(data))
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub fn method(&self) -> Option<&SipMethod> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, StartLine::Response { .. })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.set_body(body);
        self
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID").filter(|v| !v.is_empty())
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_token(parts.next()?);
        Some((seq, method))
    }

    /// Serialize with a Content-Length computed from the body
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(256 + self.body.len());
        out.push_str(&self.start_line.to_string());
        out.push_str(CRLF);

        for (name, value) in &self.headers {
            if is_content_length(name) {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }

        out.push_str(&format!("Content-Length: {}", self.body.len()));
        out.push_str(CRLF);
        out.push_str(CRLF);
        out.push_str(&self.body);
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.serialize())
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start_line)
    }
}

pub(crate) fn is_content_length(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length") || name == "l"
}

/// Split raw text at the first blank line.
///
/// The body is everything after the blank line; a declared Content-Length is not
/// trusted over the bytes actually present.
pub(crate) fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(idx) = raw.find("\r\n\r\n") {
        return (&raw[..idx], &raw[idx + 4..]);
    }
    if let Some(idx) = raw.find("\n\n") {
        return (&raw[..idx], &raw[idx + 2..]);
    }
    (raw, "")
}

/// Extension identifier from a To/From value such as `<sip:100@example.com>;tag=x`
pub fn extract_extension(value: &str) -> Option<String> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let (user, _) = rest.split_once('@')?;
    if user.is_empty()
        || user
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | ';' | '<' | '>' | '"'))
    {
        return None;
    }
    Some(user.to_string())
}

/// Socket address from a Contact value such as `<sip:100@10.0.0.5:5062>;expires=60`
pub fn extract_contact_addr(value: &str) -> Option<SocketAddr> {
    let start = value.find("sip:")?;
    SipUri::parse(&value[start..]).ok()?.socket_addr()
}

/// `tag` parameter of a From/To value
pub fn extract_tag(value: &str) -> Option<&str> {
    value
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("tag="))
        .map(|tag| tag.trim())
        .find(|tag| !tag.is_empty())
}
