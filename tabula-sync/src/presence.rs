//! Collaboration state: who is in a collection and where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//!   presence / cursor message
//!         │
//!         ▼
//!   CollaborationService
//!         ├── PresenceStore   collection → user → PresenceInfo   (own lock)
//!         ├── CursorStore     collection → user → CursorInfo     (own lock)
//!         │
//!         ├──► Transport::broadcast_to_channel(collection, excluding session)
//!         └──► PresenceRelay (optional, presence only)
//!
//!   reaper: every cleanup_interval, drop entries idle > stale_after
//! ```
//!
//! Entries are ephemeral. An entry is either absent or present; removal is
//! idempotent, and a collection whose last entry goes away is dropped too.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::error::Result;
use crate::hub::Transport;
use crate::protocol::{MessageType, WireMessage};

// ───────────────────────────────────────────────────────────────────
// Entries
// ───────────────────────────────────────────────────────────────────

/// A user's presence in one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceInfo {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            data,
            last_seen: Utc::now(),
        }
    }
}

/// A user's cursor in one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub user_id: String,
    pub session_id: String,
    pub position: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl CursorInfo {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        position: Value,
        selection: Option<Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            position,
            selection,
            timestamp: Utc::now(),
        }
    }
}

/// Entries that carry a last-activity time.
pub trait Expiring {
    fn last_active(&self) -> DateTime<Utc>;
}

impl Expiring for PresenceInfo {
    fn last_active(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

impl Expiring for CursorInfo {
    fn last_active(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// `collection → user → entry` behind one lock.
pub struct CollectionRegistry<T> {
    entries: RwLock<HashMap<String, HashMap<String, T>>>,
}

pub type PresenceStore = CollectionRegistry<PresenceInfo>;
pub type CursorStore = CollectionRegistry<CursorInfo>;

impl<T> Default for CollectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Expiring> CollectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `(collection, user_id)`.
    pub fn upsert(&self, collection: &str, user_id: &str, entry: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .insert(user_id.to_string(), entry);
    }

    /// Remove one entry. Returns the removed entry, if any.
    pub fn remove(&self, collection: &str, user_id: &str) -> Option<T> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let users = entries.get_mut(collection)?;
        let removed = users.remove(user_id);
        if users.is_empty() {
            entries.remove(collection);
        }
        removed
    }

    /// Remove `user_id`'s entry from every collection where `matches`
    /// holds, under a single write lock.
    pub fn remove_if(&self, user_id: &str, matches: impl Fn(&T) -> bool) -> Vec<(String, T)> {
        let mut removed = Vec::new();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|collection, users| {
            if users.get(user_id).is_some_and(&matches) {
                if let Some(entry) = users.remove(user_id) {
                    removed.push((collection.clone(), entry));
                }
            }
            !users.is_empty()
        });
        removed
    }

    pub fn get(&self, collection: &str, user_id: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .and_then(|users| users.get(user_id))
            .cloned()
    }

    /// Every entry in `collection`.
    pub fn collection(&self, collection: &str) -> Vec<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn collection_count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop entries idle for longer than `stale_after` as of `now`.
    /// Returns `(collection, entry)` for each removed entry.
    pub fn remove_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> Vec<(String, T)> {
        let mut removed = Vec::new();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|collection, users| {
            users.retain(|_, entry| {
                // Entries stamped in the future are never stale.
                let idle = (now - entry.last_active()).to_std().unwrap_or_default();
                if idle > stale_after {
                    removed.push((collection.clone(), entry.clone()));
                    false
                } else {
                    true
                }
            });
            !users.is_empty()
        });
        removed
    }
}

// ───────────────────────────────────────────────────────────────────
// Service
// ───────────────────────────────────────────────────────────────────

/// Secondary distribution of presence updates (e.g. other server nodes).
pub trait PresenceRelay: Send + Sync {
    fn relay(&self, collection: &str, presence: &PresenceInfo) -> Result<()>;
}

/// Reaper timing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How often the reaper runs
    pub cleanup_interval: Duration,
    /// Idle time after which an entry is dropped
    pub stale_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Presence and cursor tracking on top of a [`Transport`].
pub struct CollaborationService {
    presence: PresenceStore,
    cursors: CursorStore,
    transport: Arc<dyn Transport>,
    relay: Option<Arc<dyn PresenceRelay>>,
    config: PresenceConfig,
}

impl CollaborationService {
    pub fn new(transport: Arc<dyn Transport>, config: PresenceConfig) -> Self {
        Self {
            presence: PresenceStore::new(),
            cursors: CursorStore::new(),
            transport,
            relay: None,
            config,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn PresenceRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn broadcast(&self, msg_type: MessageType, collection: &str, data: Value, exclude: &[&str]) {
        let mut msg = WireMessage::new(msg_type).on_document(collection, None);
        msg.data = Some(data);
        self.transport.broadcast_to_channel(collection, &msg, exclude);
    }

    // ── presence ─────────────────────────────────────────────────

    /// Record `user_id` as present in `collection` and tell everyone else.
    pub fn update_user_presence(
        &self,
        collection: &str,
        user_id: &str,
        session_id: &str,
        data: Map<String, Value>,
    ) -> Result<PresenceInfo> {
        let info = PresenceInfo::new(user_id, session_id, data);
        self.presence.upsert(collection, user_id, info.clone());

        self.broadcast(
            MessageType::Presence,
            collection,
            serde_json::to_value(&info)?,
            &[session_id],
        );
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.relay(collection, &info) {
                log::error!("Presence relay failed for {collection}/{user_id}: {e}");
            }
        }
        Ok(info)
    }

    /// Remove `user_id` from `collection` and broadcast it as offline.
    pub fn remove_user_presence(&self, collection: &str, user_id: &str) -> Option<PresenceInfo> {
        let removed = self.presence.remove(collection, user_id)?;
        self.broadcast(
            MessageType::Presence,
            collection,
            json!({"user_id": user_id, "status": "offline"}),
            &[],
        );
        Some(removed)
    }

    pub fn presence(&self, collection: &str) -> Vec<PresenceInfo> {
        self.presence.collection(collection)
    }

    // ── cursors ──────────────────────────────────────────────────

    pub fn update_user_cursor(
        &self,
        collection: &str,
        user_id: &str,
        session_id: &str,
        position: Value,
        selection: Option<Value>,
    ) -> Result<CursorInfo> {
        let cursor = CursorInfo::new(user_id, session_id, position, selection);
        self.cursors.upsert(collection, user_id, cursor.clone());
        self.broadcast(
            MessageType::Cursor,
            collection,
            serde_json::to_value(&cursor)?,
            &[session_id],
        );
        Ok(cursor)
    }

    pub fn remove_user_cursor(&self, collection: &str, user_id: &str) -> Option<CursorInfo> {
        let removed = self.cursors.remove(collection, user_id)?;
        self.broadcast(
            MessageType::Cursor,
            collection,
            json!({"user_id": user_id, "removed": true}),
            &[removed.session_id.as_str()],
        );
        Some(removed)
    }

    pub fn cursors(&self, collection: &str) -> Vec<CursorInfo> {
        self.cursors.collection(collection)
    }

    /// Drop every presence and cursor entry a disconnecting session left
    /// behind. Entries since replaced by another session of the same user
    /// are kept.
    pub fn remove_session(&self, user_id: &str, session_id: &str) {
        let presence = self.presence.remove_if(user_id, |p| p.session_id == session_id);
        for (collection, _) in &presence {
            self.broadcast(
                MessageType::Presence,
                collection,
                json!({"user_id": user_id, "status": "offline"}),
                &[],
            );
        }

        let cursors = self.cursors.remove_if(user_id, |c| c.session_id == session_id);
        for (collection, _) in &cursors {
            self.broadcast(
                MessageType::Cursor,
                collection,
                json!({"user_id": user_id, "removed": true}),
                &[session_id],
            );
        }
        log::debug!(
            "Session {session_id} of {user_id} left {} presence and {} cursor entries",
            presence.len(),
            cursors.len()
        );
    }

    // ── notifications ────────────────────────────────────────────

    /// Send a `notification` to every connection of `user_id`.
    /// Returns the number of connections reached.
    pub fn notify(&self, collection: &str, user_id: &str, kind: &str, data: Value) -> usize {
        let mut msg = WireMessage::new(MessageType::Notification).on_document(collection, None);
        msg.data = Some(json!({"kind": kind, "data": data}));
        let reached = self.transport.broadcast_to_user(user_id, &msg);
        log::debug!("Notification {kind} for {user_id} on {collection} reached {reached} connections");
        reached
    }

    // ── reaper ───────────────────────────────────────────────────

    /// Remove entries idle for longer than `stale_after` as of `now`.
    pub fn cleanup_stale_at(&self, now: DateTime<Utc>) -> usize {
        let stale = self.presence.remove_stale(self.config.stale_after, now);
        for (collection, info) in &stale {
            log::debug!("Removed stale presence of {} in {collection}", info.user_id);
            self.broadcast(
                MessageType::Presence,
                collection,
                json!({"user_id": info.user_id, "status": "offline"}),
                &[],
            );
        }
        let cursors = self.cursors.remove_stale(self.config.stale_after, now);
        for (collection, cursor) in &cursors {
            log::debug!("Removed stale cursor of {} in {collection}", cursor.user_id);
        }
        stale.len() + cursors.len()
    }

    pub fn cleanup_stale_presence(&self) -> usize {
        self.cleanup_stale_at(Utc::now())
    }

    /// Run the reaper every `cleanup_interval` until `shutdown` flips to
    /// `true` or its sender is dropped.
    pub async fn run_presence_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;
        log::info!(
            "Presence reaper started (interval {:?}, stale after {:?})",
            self.config.cleanup_interval,
            self.config.stale_after
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup_stale_presence();
                    if removed > 0 {
                        log::debug!("Presence reaper removed {removed} entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Presence reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::Mutex;

    /// Records every broadcast as `(target, type, excluded sessions)`.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, MessageType, Vec<String>)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(String, MessageType, Vec<String>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn broadcast_to_channel(&self, channel: &str, message: &WireMessage, exclude: &[&str]) -> usize {
            self.sent.lock().unwrap().push((
                channel.to_string(),
                message.msg_type.clone(),
                exclude.iter().map(|s| s.to_string()).collect(),
            ));
            1
        }

        fn broadcast_to_user(&self, user_id: &str, message: &WireMessage) -> usize {
            self.sent
                .lock()
                .unwrap()
                .push((format!("user:{user_id}"), message.msg_type.clone(), Vec::new()));
            2
        }

        fn send_to_connection(&self, _: &str, _: &WireMessage) -> Result<()> {
            Ok(())
        }

        fn subscribe(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        fn unsubscribe(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FailingRelay {
        calls: Mutex<usize>,
    }

    impl PresenceRelay for FailingRelay {
        fn relay(&self, _: &str, _: &PresenceInfo) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            Err(SyncError::Transport("relay down".into()))
        }
    }

    fn service() -> (Arc<RecordingTransport>, CollaborationService) {
        let transport = Arc::new(RecordingTransport::default());
        let svc = CollaborationService::new(transport.clone(), PresenceConfig::default());
        (transport, svc)
    }

    fn status(name: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("name".into(), json!(name));
        m
    }

    #[test]
    fn test_presence_config_default() {
        let config = PresenceConfig::default();
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.stale_after, Duration::from_secs(300));
    }

    #[test]
    fn test_update_overwrites_and_broadcasts() {
        let (transport, svc) = service();
        svc.update_user_presence("t1", "u1", "s1", status("a")).unwrap();
        svc.update_user_presence("t1", "u1", "s1", status("b")).unwrap();

        let present = svc.presence("t1");
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].data["name"], json!("b"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("t1".to_string(), MessageType::Presence, vec!["s1".to_string()]));
    }

    #[test]
    fn test_remove_drops_empty_collection() {
        let (transport, svc) = service();
        svc.update_user_presence("t1", "u1", "s1", Map::new()).unwrap();
        assert!(svc.remove_user_presence("t1", "u1").is_some());
        assert!(svc.presence("t1").is_empty());
        assert_eq!(svc.presence.collection_count(), 0);

        // idempotent, and silent the second time
        assert!(svc.remove_user_presence("t1", "u1").is_none());
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn test_cursor_lifecycle() {
        let (transport, svc) = service();
        svc.update_user_cursor("t1", "u1", "s1", json!({"row": 3}), None).unwrap();
        svc.update_user_cursor("t1", "u2", "s2", json!({"row": 4}), Some(json!([4, 5])))
            .unwrap();
        assert_eq!(svc.cursors("t1").len(), 2);

        let removed = svc.remove_user_cursor("t1", "u1").unwrap();
        assert_eq!(removed.position, json!({"row": 3}));
        assert_eq!(svc.cursors("t1").len(), 1);
        assert!(transport.sent().iter().all(|(_, t, _)| *t == MessageType::Cursor));
    }

    #[test]
    fn test_stale_entries_are_reaped() {
        let (_, svc) = service();
        svc.update_user_presence("t1", "u1", "s1", Map::new()).unwrap();
        svc.update_user_cursor("t1", "u1", "s1", json!(1), None).unwrap();

        assert_eq!(svc.cleanup_stale_at(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(svc.cleanup_stale_at(later), 2);
        assert!(svc.presence("t1").is_empty());
        assert!(svc.cursors("t1").is_empty());
    }

    #[test]
    fn test_relay_errors_are_logged_not_returned() {
        let transport = Arc::new(RecordingTransport::default());
        let relay = Arc::new(FailingRelay { calls: Mutex::new(0) });
        let svc = CollaborationService::new(transport, PresenceConfig::default())
            .with_relay(relay.clone());

        assert!(svc.update_user_presence("t1", "u1", "s1", Map::new()).is_ok());
        assert_eq!(*relay.calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_notify_targets_user() {
        let (transport, svc) = service();
        assert_eq!(svc.notify("t1", "u9", "mention", json!({"record": "r1"})), 2);
        assert_eq!(
            transport.sent(),
            vec![("user:u9".to_string(), MessageType::Notification, Vec::new())]
        );
    }

    #[test]
    fn test_remove_session_only_touches_that_session() {
        let (_, svc) = service();
        svc.update_user_presence("t1", "u1", "s1", Map::new()).unwrap();
        svc.update_user_presence("t2", "u1", "s2", Map::new()).unwrap();
        svc.update_user_cursor("t1", "u1", "s1", json!(0), None).unwrap();

        svc.remove_session("u1", "s1");
        assert!(svc.presence("t1").is_empty());
        assert_eq!(svc.presence("t2").len(), 1);
        assert!(svc.cursors("t1").is_empty());
    }

    #[test]
    fn test_remove_session_keeps_newer_session_of_same_user() {
        let (transport, svc) = service();
        svc.update_user_presence("t1", "u1", "s1", status("old")).unwrap();
        svc.update_user_cursor("t1", "u1", "s1", json!(0), None).unwrap();
        svc.update_user_presence("t1", "u1", "s2", status("new")).unwrap();
        svc.update_user_cursor("t1", "u1", "s2", json!(7), None).unwrap();
        let before = transport.sent().len();

        svc.remove_session("u1", "s1");
        let present = svc.presence("t1");
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].session_id, "s2");
        assert_eq!(present[0].data["name"], json!("new"));
        assert_eq!(svc.cursors("t1")[0].position, json!(7));
        assert_eq!(transport.sent().len(), before);

        svc.remove_session("u1", "s2");
        assert!(svc.presence("t1").is_empty());
        assert!(svc.cursors("t1").is_empty());
        assert_eq!(transport.sent().len(), before + 2);
    }

    #[test]
    fn test_registry_remove_if() {
        let store = PresenceStore::new();
        store.upsert("t1", "u1", PresenceInfo::new("u1", "s1", Map::new()));
        store.upsert("t2", "u1", PresenceInfo::new("u1", "s2", Map::new()));
        store.upsert("t2", "u2", PresenceInfo::new("u2", "s1", Map::new()));

        let removed = store.remove_if("u1", |p| p.session_id == "s1");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "t1");
        assert_eq!(store.collection_count(), 1);
        assert!(store.get("t2", "u1").is_some());
        assert!(store.get("t2", "u2").is_some());
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let transport = Arc::new(RecordingTransport::default());
        let svc = Arc::new(CollaborationService::new(
            transport,
            PresenceConfig {
                cleanup_interval: Duration::from_millis(10),
                stale_after: Duration::from_millis(20),
            },
        ));
        svc.update_user_presence("t1", "u1", "s1", Map::new()).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(svc.clone().run_presence_cleanup(rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(svc.presence("t1").is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
