//! SIP Registrar - manages extension registrations

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registration entry for one extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub extension: String,
    /// Where requests for this extension are sent
    pub contact: SocketAddr,
    /// Contact header text as received
    pub contact_uri: String,
    pub registered_at: DateTime<Utc>,
    pub expires: Duration,
}

impl Registration {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.registered_at + self.expires
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// In-memory registrar, one live registration per extension
pub struct Registrar {
    registrations: RwLock<HashMap<String, Registration>>,
    /// Default expiration time (seconds)
    default_expires: u32,
    /// Maximum expiration time (seconds)
    max_expires: u32,
}

impl Registrar {
    pub fn new(default_expires: u32, max_expires: u32) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            default_expires,
            max_expires,
        }
    }

    /// Granted lifetime for a requested Expires value; 0 means unregister
    pub fn effective_expires(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) => 0,
            Some(expires) if expires > self.max_expires => self.max_expires,
            Some(expires) => expires,
            None => self.default_expires.min(self.max_expires),
        }
    }

    /// Create or overwrite the registration for `extension`
    pub async fn register(
        &self,
        extension: &str,
        contact: SocketAddr,
        contact_uri: &str,
        expires_secs: u32,
    ) -> Registration {
        let registration = Registration {
            extension: extension.to_string(),
            contact,
            contact_uri: contact_uri.to_string(),
            registered_at: Utc::now(),
            expires: Duration::seconds(expires_secs as i64),
        };

        self.registrations
            .write()
            .await
            .insert(extension.to_string(), registration.clone());

        info!(
            "Registered: {} -> {} (expires in {}s)",
            extension, contact, expires_secs
        );
        registration
    }

    pub async fn unregister(&self, extension: &str) -> bool {
        let removed = self.registrations.write().await.remove(extension).is_some();
        if removed {
            info!("Unregistered: {}", extension);
        }
        removed
    }

    /// Live registration for `extension` as of `now`; an expired entry is removed
    pub async fn lookup_at(&self, extension: &str, now: DateTime<Utc>) -> Option<Registration> {
        {
            let registrations = self.registrations.read().await;
            match registrations.get(extension) {
                None => return None,
                Some(reg) if !reg.is_expired_at(now) => return Some(reg.clone()),
                Some(_) => {}
            }
        }

        let mut registrations = self.registrations.write().await;
        if registrations
            .get(extension)
            .map(|reg| reg.is_expired_at(now))
            .unwrap_or(false)
        {
            registrations.remove(extension);
            debug!("Registration for {} expired", extension);
        }
        None
    }

    pub async fn lookup(&self, extension: &str) -> Option<Registration> {
        self.lookup_at(extension, Utc::now()).await
    }

    pub async fn contact_of(&self, extension: &str) -> Option<SocketAddr> {
        self.lookup(extension).await.map(|reg| reg.contact)
    }

    pub async fn is_registered(&self, extension: &str) -> bool {
        self.lookup(extension).await.is_some()
    }

    /// Remove every registration expired as of `now`
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|_, reg| !reg.is_expired_at(now));
        let removed = before - registrations.len();

        if removed > 0 {
            info!("Removed {} expired registrations", removed);
        }
        removed
    }

    /// Live registrations, ordered by extension
    pub async fn registrations(&self) -> Vec<Registration> {
        let now = Utc::now();
        let mut list: Vec<Registration> = self
            .registrations
            .read()
            .await
            .values()
            .filter(|reg| !reg.is_expired_at(now))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.extension.cmp(&b.extension));
        list
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new(3600, 3600)
    }
}
