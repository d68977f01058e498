//! SIP Digest Authentication (RFC 2617, RFC 3261)

use super::message::{SipError, SipMessage};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifetime of a server-issued nonce
pub const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Nonce count sent with every client response
const NONCE_COUNT: &str = "00000001";

/// Authentication challenge (WWW-Authenticate / Proxy-Authenticate)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Raw qop option list as offered, e.g. `auth,auth-int`
    pub qop: Option<String>,
    pub algorithm: String,
}

impl AuthChallenge {
    /// Create a new challenge with a fresh nonce
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: random_hex(16),
            opaque: None,
            qop: Some("auth".to_string()),
            algorithm: "MD5".to_string(),
        }
    }

    /// Parse a `Digest ...` challenge header value
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let params = parse_digest_params(value);

        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            realm: realm.clone(),
            nonce: nonce.clone(),
            opaque: params.get("opaque").cloned(),
            qop: params.get("qop").cloned(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
        })
    }

    /// qop used in the answer: `auth` when offered, otherwise none
    pub fn selected_qop(&self) -> Option<&'static str> {
        self.qop.as_deref().and_then(|list| {
            list.split(',')
                .map(str::trim)
                .any(|q| q == "auth")
                .then_some("auth")
        })
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }

    /// Build the Authorization header value answering this challenge.
    ///
    /// A fresh cnonce is drawn on every call.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let qop = self.selected_qop();
        let cnonce = random_hex(8);

        let response = compute_response(
            username,
            password,
            &self.realm,
            &self.nonce,
            method,
            uri,
            qop.map(|q| (NONCE_COUNT, cnonce.as_str(), q)),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            username, self.realm, self.nonce, uri, response, self.algorithm
        );
        if let Some(qop) = qop {
            value.push_str(&format!(
                r#", qop={}, nc={}, cnonce="{}""#,
                qop, NONCE_COUNT, cnonce
            ));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    /// Parse Authorization or Proxy-Authorization from a request
    pub fn from_message(message: &SipMessage) -> Result<Self, SipError> {
        let value = message
            .header("Authorization")
            .or_else(|| message.header("Proxy-Authorization"))
            .ok_or_else(|| SipError::Authentication("No Authorization header found".to_string()))?;

        debug!("Parsing Authorization header: {}", value);
        let mut params = parse_digest_params(value);

        let mut required = |name: &str| {
            params.remove(name).ok_or_else(|| {
                SipError::Authentication(format!("Missing {} in Authorization", name))
            })
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            qop: params.remove("qop"),
            nc: params.remove("nc"),
            cnonce: params.remove("cnonce"),
        })
    }
}

/// Split `Digest k=v, k="v, w"` into parameters; commas inside quotes are kept
pub fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let rest = value.trim();
    let rest = rest
        .strip_prefix("Digest")
        .map(str::trim_start)
        .unwrap_or(rest);

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in rest.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .iter()
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

/// Digest response.
///
/// `qop` carries `(nc, cnonce, qop)` when the challenge offered quality of protection.
pub fn compute_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    let digest = match qop {
        Some((nc, cnonce, qop)) => md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
    };
    format!("{:x}", digest)
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Server-side digest verification for REGISTER
pub struct DigestAuth {
    realm: String,
    /// username -> password
    users: RwLock<HashMap<String, String>>,
    active_nonces: RwLock<HashMap<String, Instant>>,
}

impl DigestAuth {
    pub fn new(realm: &str) -> Self {
        Self::with_users(realm, HashMap::new())
    }

    pub fn with_users(realm: &str, users: HashMap<String, String>) -> Self {
        Self {
            realm: realm.to_string(),
            users: RwLock::new(users),
            active_nonces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_user(&self, username: &str, password: &str) {
        self.users
            .write()
            .await
            .insert(username.to_string(), password.to_string());
        info!("Added user: {}", username);
    }

    /// Generate a challenge and remember its nonce
    pub async fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);
        self.active_nonces
            .write()
            .await
            .insert(challenge.nonce.clone(), Instant::now());

        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    /// Check the credentials on `request`, returning the authenticated username
    pub async fn verify(&self, request: &SipMessage, method: &str) -> Result<String, SipError> {
        let auth = AuthorizationHeader::from_message(request)?;

        {
            let nonces = self.active_nonces.read().await;
            let issued = nonces.get(&auth.nonce).ok_or_else(|| {
                SipError::Authentication("Invalid or expired nonce".to_string())
            })?;
            if issued.elapsed() > NONCE_LIFETIME {
                return Err(SipError::Authentication("Nonce expired".to_string()));
            }
        }

        if auth.realm != self.realm {
            warn!("Realm mismatch: expected {}, got {}", self.realm, auth.realm);
            return Err(SipError::Authentication("Realm mismatch".to_string()));
        }

        let password = self
            .users
            .read()
            .await
            .get(&auth.username)
            .cloned()
            .ok_or_else(|| {
                warn!("Authentication failed: unknown user {}", auth.username);
                SipError::Authentication(format!("Unknown user: {}", auth.username))
            })?;

        let qop = auth.qop.as_deref().map(|qop| {
            (
                auth.nc.as_deref().unwrap_or(NONCE_COUNT),
                auth.cnonce.as_deref().unwrap_or(""),
                qop,
            )
        });
        let expected = compute_response(
            &auth.username,
            &password,
            &auth.realm,
            &auth.nonce,
            method,
            &auth.uri,
            qop,
        );

        if auth.response != expected {
            warn!("Authentication failed for user {}: response mismatch", auth.username);
            return Err(SipError::Authentication("Invalid credentials".to_string()));
        }

        info!("Authentication successful for user: {}", auth.username);
        Ok(auth.username)
    }

    /// Forget nonces past their lifetime
    pub async fn cleanup_nonces(&self) {
        self.active_nonces
            .write()
            .await
            .retain(|_, issued| issued.elapsed() <= NONCE_LIFETIME);
    }
}
