//! Simple SDP (Session Description Protocol) handling
//!
//! Only the connection line (`c=`) and the audio media line (`m=audio`) are
//! interpreted. Every other line is opaque and survives a rewrite byte for byte.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::message::{is_content_length, split_head_body, CRLF};

/// Used when an offer or answer carries no usable `c=` line
pub const DEFAULT_MEDIA_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// Used when an offer or answer carries no usable `m=audio` line
pub const DEFAULT_MEDIA_PORT: u16 = 10000;

/// Media endpoint advertised by a session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub connection_address: IpAddr,
    pub audio_port: u16,
    pub transport: String,
    /// Payload formats as listed on the audio line
    pub formats: Vec<String>,
}

impl Default for SessionDescription {
    fn default() -> Self {
        Self {
            connection_address: DEFAULT_MEDIA_ADDRESS,
            audio_port: DEFAULT_MEDIA_PORT,
            transport: "RTP/AVP".to_string(),
            formats: Vec::new(),
        }
    }
}

impl SessionDescription {
    /// Parse SDP from a message body, falling back to defaults for anything missing
    pub fn parse(body: &str) -> Self {
        let mut sdp = Self::default();
        let mut seen_audio = false;

        for line in body.lines() {
            let line = line.trim_end();

            if let Some(rest) = line.strip_prefix("c=") {
                // c=<nettype> <addrtype> <address>[/ttl]
                if let Some(address) = rest
                    .split_whitespace()
                    .nth(2)
                    .and_then(|a| a.split('/').next())
                    .and_then(|a| a.parse::<IpAddr>().ok())
                {
                    sdp.connection_address = address;
                }
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                if seen_audio {
                    continue;
                }
                seen_audio = true;

                let mut parts = rest.split_whitespace();
                if let Some(port) = parts
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse::<u16>().ok())
                {
                    sdp.audio_port = port;
                }
                if let Some(transport) = parts.next() {
                    sdp.transport = transport.to_string();
                }
                sdp.formats = parts.map(|f| f.to_string()).collect();
            }
        }

        sdp
    }

    pub fn media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.connection_address, self.audio_port)
    }

    /// Build an audio-only body offering PCMU, PCMA and telephone-event
    pub fn audio_offer(username: &str, address: IpAddr, port: u16) -> String {
        let addr_type = address_type(address);
        let session_id = chrono::Utc::now().timestamp();

        let mut sdp = String::new();
        sdp.push_str(&format!("v=0{}", CRLF));
        sdp.push_str(&format!(
            "o={} {} 1 IN {} {}{}",
            username, session_id, addr_type, address, CRLF
        ));
        sdp.push_str(&format!("s=siprelay{}", CRLF));
        sdp.push_str(&format!("c=IN {} {}{}", addr_type, address, CRLF));
        sdp.push_str(&format!("t=0 0{}", CRLF));
        sdp.push_str(&format!("m=audio {} RTP/AVP 0 8 101{}", port, CRLF));
        sdp.push_str(&format!("a=rtpmap:0 PCMU/8000{}", CRLF));
        sdp.push_str(&format!("a=rtpmap:8 PCMA/8000{}", CRLF));
        sdp.push_str(&format!("a=rtpmap:101 telephone-event/8000{}", CRLF));
        sdp.push_str(&format!("a=fmtp:101 0-16{}", CRLF));
        sdp.push_str(&format!("a=sendrecv{}", CRLF));
        sdp
    }
}

fn address_type(address: IpAddr) -> &'static str {
    if address.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

/// Point the connection address and the audio port of `body` at the relay.
///
/// Lines other than `c=` and `m=audio` are copied unchanged, terminators included.
pub fn rewrite_for_relay(body: &str, relay_port: u16, relay_address: IpAddr) -> String {
    let mut out = String::with_capacity(body.len() + 16);

    for segment in body.split_inclusive('\n') {
        let content = segment.trim_end_matches(['\r', '\n']);
        let terminator = &segment[content.len()..];

        if content.starts_with("c=") {
            out.push_str(&format!(
                "c=IN {} {}",
                address_type(relay_address),
                relay_address
            ));
        } else if content.starts_with("m=audio ") {
            let mut fields: Vec<&str> = content.split(' ').collect();
            let port = relay_port.to_string();
            if fields.len() > 1 {
                fields[1] = &port;
            }
            out.push_str(&fields.join(" "));
        } else {
            out.push_str(content);
        }

        out.push_str(terminator);
    }

    out
}

/// Reassemble `original` with `new_body`, recomputing Content-Length
pub fn reserialize_message(original: &str, new_body: &str) -> String {
    let (head, _) = split_head_body(original);

    let mut lines: Vec<String> = Vec::new();
    let mut has_length = false;
    for line in head.lines() {
        let is_length = line
            .split_once(':')
            .map(|(name, _)| is_content_length(name.trim()))
            .unwrap_or(false);
        if is_length {
            if !has_length {
                lines.push(format!("Content-Length: {}", new_body.len()));
                has_length = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }
    if !has_length {
        lines.push(format!("Content-Length: {}", new_body.len()));
    }

    let mut out = lines.join(CRLF);
    out.push_str(CRLF);
    out.push_str(CRLF);
    out.push_str(new_body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipMessage;

    const OFFER: &str = "v=0\r\n\
        o=100 123 1 IN IP4 192.168.1.10\r\n\
        s=call\r\n\
        c=IN IP4 192.168.1.10\r\n\
        t=0 0\r\n\
        m=audio 12000 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SessionDescription::parse(OFFER);
        assert_eq!(
            sdp.connection_address,
            "192.168.1.10".parse::<IpAddr>().unwrap()
        );
        assert_eq!(sdp.audio_port, 12000);
        assert_eq!(sdp.transport, "RTP/AVP");
        assert_eq!(sdp.formats, vec!["0", "8", "101"]);
        assert_eq!(sdp.media_addr(), "192.168.1.10:12000".parse().unwrap());
    }

    #[test]
    fn test_parse_defaults_when_absent() {
        let sdp = SessionDescription::parse("");
        assert_eq!(sdp.media_addr(), "127.0.0.1:10000".parse().unwrap());

        let sdp = SessionDescription::parse("c=IN IP4 not-an-ip\r\nm=audio x RTP/AVP 0\r\n");
        assert_eq!(sdp.connection_address, DEFAULT_MEDIA_ADDRESS);
        assert_eq!(sdp.audio_port, DEFAULT_MEDIA_PORT);
    }

    #[test]
    fn test_rewrite_round_trip_preserves_other_lines() {
        let relay: IpAddr = "10.0.0.1".parse().unwrap();
        let rewritten = rewrite_for_relay(OFFER, 20000, relay);

        let parsed = SessionDescription::parse(&rewritten);
        assert_eq!(parsed.connection_address, relay);
        assert_eq!(parsed.audio_port, 20000);
        assert_eq!(parsed.formats, vec!["0", "8", "101"]);

        let before: Vec<&str> = OFFER.split_inclusive('\n').collect();
        let after: Vec<&str> = rewritten.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            if b.starts_with("c=") || b.starts_with("m=audio") {
                assert_ne!(b, a);
            } else {
                assert_eq!(b, a);
            }
        }
    }

    #[test]
    fn test_rewrite_keeps_bare_lf_terminators() {
        let body = "v=0\nc=IN IP4 1.2.3.4\nm=audio 4000 RTP/AVP 0\na=x";
        let rewritten = rewrite_for_relay(body, 5000, "127.0.0.1".parse().unwrap());
        assert_eq!(
            rewritten,
            "v=0\nc=IN IP4 127.0.0.1\nm=audio 5000 RTP/AVP 0\na=x"
        );
    }

    #[test]
    fn test_reserialize_message_updates_content_length() {
        let invite = format!(
            "INVITE sip:101@example.com SIP/2.0\r\nCall-ID: c1\r\nContent-Length: {}\r\n\r\n{}",
            OFFER.len(),
            OFFER
        );
        let new_body = rewrite_for_relay(OFFER, 20000, "10.0.0.1".parse().unwrap());
        let text = reserialize_message(&invite, &new_body);

        let msg = SipMessage::parse(&text);
        assert_eq!(msg.call_id(), Some("c1"));
        assert_eq!(msg.body(), new_body);
        assert_eq!(
            msg.header("Content-Length"),
            Some(new_body.len().to_string().as_str())
        );
    }

    #[test]
    fn test_reserialize_adds_missing_content_length() {
        let text = reserialize_message("SIP/2.0 200 OK\r\nCall-ID: c2\r\n\r\n", "v=0\r\n");
        assert!(text.ends_with("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_audio_offer() {
        let body = SessionDescription::audio_offer("100", "127.0.0.1".parse().unwrap(), 4000);
        let sdp = SessionDescription::parse(&body);
        assert_eq!(sdp.media_addr(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(sdp.formats, vec!["0", "8", "101"]);
        assert!(body.ends_with("a=sendrecv\r\n"));
    }
}
