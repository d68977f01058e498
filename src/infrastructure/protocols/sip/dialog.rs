//! Call table
//!
//! One entry per Call-ID, created when an INVITE is accepted for routing and
//! removed on BYE, on a failure response, or by the sweep once it has been
//! ringing too long. Terminal states are only observed at removal.

use super::message::SipMessage;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::RwLock;

/// Call State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// INVITE forwarded, waiting for the callee's final response
    Ringing,
    /// 2xx forwarded, media flowing
    Active,
    /// Non-success final response
    Failed,
    /// BYE processed
    TornDown,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Failed | CallState::TornDown)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Ringing => "Ringing",
            CallState::Active => "Active",
            CallState::Failed => "Failed",
            CallState::TornDown => "TornDown",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of a server-originated call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginateStage {
    /// INVITE sent to the first party
    CallingCaller,
    /// First party answered, INVITE sent to the second party
    CallingCallee,
    Connected,
}

/// Requests the server sent as user agent on both legs of an originated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginatedCall {
    pub stage: OriginateStage,
    pub caller_invite: SipMessage,
    pub caller_answer: Option<SipMessage>,
    pub callee_invite: Option<SipMessage>,
    pub callee_answer: Option<SipMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogOrigin {
    /// INVITE from a registered endpoint routed to another
    Proxied,
    /// Click-to-call placed by the server
    Originated(Box<OriginatedCall>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    /// Media address from the caller's offer, once known
    pub caller_media: Option<SocketAddr>,
    pub caller_signaling: SocketAddr,
    pub callee_contact: SocketAddr,
    /// Offer body as received (or as generated for originated calls)
    pub offer: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub origin: DialogOrigin,
}

impl Dialog {
    pub fn is_originated(&self) -> bool {
        matches!(self.origin, DialogOrigin::Originated(_))
    }

    /// Signaling address of the party opposite `source`, None when `source`
    /// is neither party
    pub fn peer_of(&self, source: SocketAddr) -> Option<SocketAddr> {
        if source == self.caller_signaling {
            Some(self.callee_contact)
        } else if source == self.callee_contact {
            Some(self.caller_signaling)
        } else {
            None
        }
    }
}

/// Dialog table keyed by Call-ID
#[derive(Default)]
pub struct DialogTable {
    dialogs: RwLock<HashMap<String, Dialog>>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the Call-ID is already present
    pub async fn insert(&self, dialog: Dialog) -> bool {
        let mut dialogs = self.dialogs.write().await;
        if dialogs.contains_key(&dialog.call_id) {
            return false;
        }
        dialogs.insert(dialog.call_id.clone(), dialog);
        true
    }

    pub async fn get(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.read().await.get(call_id).cloned()
    }

    /// Apply `f` to the dialog and return the updated copy
    pub async fn update<F>(&self, call_id: &str, f: F) -> Option<Dialog>
    where
        F: FnOnce(&mut Dialog),
    {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs.get_mut(call_id)?;
        f(dialog);
        Some(dialog.clone())
    }

    pub async fn remove(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.write().await.remove(call_id)
    }

    /// Remove calls still ringing after `max_age`
    pub async fn remove_unanswered(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<Dialog> {
        let mut dialogs = self.dialogs.write().await;
        let stale: Vec<String> = dialogs
            .values()
            .filter(|d| d.state == CallState::Ringing && now - d.created_at >= max_age)
            .map(|d| d.call_id.clone())
            .collect();
        stale.iter().filter_map(|id| dialogs.remove(id)).collect()
    }

    /// All dialogs, oldest first
    pub async fn list(&self) -> Vec<Dialog> {
        let mut list: Vec<Dialog> = self.dialogs.read().await.values().cloned().collect();
        list.sort_by_key(|d| d.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.dialogs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.dialogs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(call_id: &str) -> Dialog {
        Dialog {
            call_id: call_id.to_string(),
            caller: "100".to_string(),
            callee: "101".to_string(),
            caller_media: Some("10.0.0.1:12000".parse().unwrap()),
            caller_signaling: "10.0.0.1:5060".parse().unwrap(),
            callee_contact: "10.0.0.2:5060".parse().unwrap(),
            offer: String::new(),
            state: CallState::Ringing,
            created_at: Utc::now(),
            origin: DialogOrigin::Proxied,
        }
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let table = DialogTable::new();
        assert!(table.insert(dialog("c1")).await);
        assert!(!table.insert(dialog("c1")).await);
        assert_eq!(table.len().await, 1);

        assert_eq!(table.get("c1").await.unwrap().callee, "101");
        assert!(table.remove("c1").await.is_some());
        assert!(table.remove("c1").await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_state() {
        let table = DialogTable::new();
        table.insert(dialog("c2")).await;

        let updated = table
            .update("c2", |d| d.state = CallState::Active)
            .await
            .unwrap();
        assert_eq!(updated.state, CallState::Active);
        assert_eq!(table.get("c2").await.unwrap().state, CallState::Active);
        assert!(table.update("missing", |d| d.state = CallState::Failed).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unanswered() {
        let table = DialogTable::new();
        let now = Utc::now();

        let mut old = dialog("old");
        old.created_at = now - Duration::seconds(300);
        let mut answered = dialog("answered");
        answered.created_at = now - Duration::seconds(300);
        answered.state = CallState::Active;
        table.insert(old).await;
        table.insert(answered).await;
        table.insert(dialog("fresh")).await;

        let removed = table.remove_unanswered(now, Duration::seconds(180)).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].call_id, "old");
        assert_eq!(table.len().await, 2);
        assert!(table.get("answered").await.is_some());
        assert!(table.get("fresh").await.is_some());
    }

    #[test]
    fn test_peer_of() {
        let d = dialog("c3");
        assert_eq!(d.peer_of(d.caller_signaling), Some(d.callee_contact));
        assert_eq!(d.peer_of(d.callee_contact), Some(d.caller_signaling));
        assert_eq!(d.peer_of("10.0.0.9:5060".parse().unwrap()), None);
        assert!(!d.is_originated());
        assert!(CallState::TornDown.is_terminal());
        assert!(!CallState::Active.is_terminal());
    }
}
