//! Live-connection registry and outbound fan-out.
//!
//! ```text
//!   ConnectionHub (one RwLock)
//!     ├── connections: conn_id → { info, sender, channels, last_seen }
//!     ├── channels:    channel → {conn_id}
//!     └── users:       user_id → {conn_id}
//!
//!   broadcast_to_channel(ch, msg, exclude_sessions)
//!     encode once ─► try_send to every subscriber's bounded queue
//!                    full/closed queue ─► connection unregistered
//! ```
//!
//! Each connection owns a bounded `mpsc` queue of encoded frames; the
//! socket task drains it. Senders never block: a consumer that cannot keep
//! up is dropped rather than slowing every other subscriber down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Result, SyncError};
use crate::protocol::WireMessage;
use crate::types::ConnectionInfo;

/// One encoded JSON text frame.
pub type Frame = Arc<str>;

/// Outbound side of the live-connection transport.
pub trait Transport: Send + Sync {
    /// Send to every connection subscribed to `channel` whose session is
    /// not in `exclude_sessions`. Returns the number of connections reached.
    fn broadcast_to_channel(
        &self,
        channel: &str,
        message: &WireMessage,
        exclude_sessions: &[&str],
    ) -> usize;

    /// Send to every connection of `user_id`.
    fn broadcast_to_user(&self, user_id: &str, message: &WireMessage) -> usize;

    fn send_to_connection(&self, conn_id: &str, message: &WireMessage) -> Result<()>;

    fn subscribe(&self, conn_id: &str, channel: &str) -> Result<()>;

    fn unsubscribe(&self, conn_id: &str, channel: &str) -> Result<()>;
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
    pub channels: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct ConnectionEntry {
    info: ConnectionInfo,
    sender: mpsc::Sender<Frame>,
    channels: HashSet<String>,
    last_seen: Instant,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, ConnectionEntry>,
    channels: HashMap<String, HashSet<String>>,
    users: HashMap<String, HashSet<String>>,
}

impl HubState {
    fn remove(&mut self, conn_id: &str) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(conn_id)?;
        for ch in &entry.channels {
            if let Some(members) = self.channels.get_mut(ch) {
                members.remove(conn_id);
                if members.is_empty() {
                    self.channels.remove(ch);
                }
            }
        }
        if let Some(conns) = self.users.get_mut(&entry.info.user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                self.users.remove(&entry.info.user_id);
            }
        }
        Some(entry)
    }
}

/// In-process [`Transport`] backing the WebSocket server.
pub struct ConnectionHub {
    state: RwLock<HubState>,
    capacity: usize,
    stats: AtomicHubStats,
}

impl ConnectionHub {
    /// `capacity` is the per-connection outbound queue length.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            capacity: capacity.max(1),
            stats: AtomicHubStats::default(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HubState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection; the returned receiver yields its outbound frames.
    pub fn register(&self, info: ConnectionInfo) -> mpsc::Receiver<Frame> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let mut state = self.write();
        state
            .users
            .entry(info.user_id.clone())
            .or_default()
            .insert(info.id.clone());
        log::info!(
            "Connection {} registered (user {}, session {})",
            info.id,
            info.user_id,
            info.session_id
        );
        state.connections.insert(
            info.id.clone(),
            ConnectionEntry {
                info,
                sender,
                channels: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        receiver
    }

    /// Drop a connection and all of its subscriptions. Dropping the sender
    /// ends the connection's outbound stream.
    pub fn unregister(&self, conn_id: &str) -> bool {
        let removed = self.write().remove(conn_id);
        if let Some(entry) = &removed {
            log::info!(
                "Connection {conn_id} unregistered (user {})",
                entry.info.user_id
            );
        }
        removed.is_some()
    }

    /// Record activity on a connection.
    pub fn touch(&self, conn_id: &str) {
        if let Some(entry) = self.write().connections.get_mut(conn_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Unregister connections silent for longer than `timeout`.
    pub fn expire_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.write();
        let stale: Vec<String> = state
            .connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.remove(id);
            log::info!("Connection {id} expired after heartbeat timeout");
        }
        stale
    }

    pub fn connection(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.read().connections.get(conn_id).map(|e| e.info.clone())
    }

    pub fn user_connections(&self, user_id: &str) -> Vec<ConnectionInfo> {
        let state = self.read();
        state
            .users
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.connections.get(id))
                    .map(|e| e.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn channel_size(&self, channel: &str) -> usize {
        self.read().channels.get(channel).map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> HubStats {
        let state = self.read();
        HubStats {
            connections: state.connections.len(),
            users: state.users.len(),
            channels: state.channels.len(),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn encode(message: &WireMessage) -> Option<Frame> {
        match message.encode() {
            Ok(text) => Some(Arc::from(text)),
            Err(e) => {
                log::error!("Failed to encode {} message: {e}", message.msg_type);
                None
            }
        }
    }

    /// Push `frame` to each target; unregister the ones that cannot take it.
    fn deliver(&self, frame: &Frame, targets: Vec<(String, mpsc::Sender<Frame>)>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Connection {conn_id} outbound queue full, dropping connection");
                    dead.push(conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    dead.push(conn_id);
                }
            }
        }
        if !dead.is_empty() {
            let mut state = self.write();
            for id in &dead {
                state.remove(id);
            }
        }
        delivered
    }
}

impl Transport for ConnectionHub {
    fn broadcast_to_channel(
        &self,
        channel: &str,
        message: &WireMessage,
        exclude_sessions: &[&str],
    ) -> usize {
        let targets: Vec<(String, mpsc::Sender<Frame>)> = {
            let state = self.read();
            let Some(members) = state.channels.get(channel) else {
                return 0;
            };
            members
                .iter()
                .filter_map(|id| state.connections.get(id))
                .filter(|e| !exclude_sessions.contains(&e.info.session_id.as_str()))
                .map(|e| (e.info.id.clone(), e.sender.clone()))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = Self::encode(message) else {
            return 0;
        };
        log::trace!("Broadcasting {} to {channel} ({} targets)", message.msg_type, targets.len());
        self.deliver(&frame, targets)
    }

    fn broadcast_to_user(&self, user_id: &str, message: &WireMessage) -> usize {
        let targets: Vec<(String, mpsc::Sender<Frame>)> = {
            let state = self.read();
            let Some(ids) = state.users.get(user_id) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| state.connections.get(id))
                .map(|e| (e.info.id.clone(), e.sender.clone()))
                .collect()
        };
        let Some(frame) = Self::encode(message) else {
            return 0;
        };
        self.deliver(&frame, targets)
    }

    fn send_to_connection(&self, conn_id: &str, message: &WireMessage) -> Result<()> {
        let sender = self
            .read()
            .connections
            .get(conn_id)
            .map(|e| e.sender.clone())
            .ok_or_else(|| SyncError::Transport(format!("unknown connection {conn_id}")))?;
        let frame = Arc::from(message.encode()?);
        if self.deliver(&frame, vec![(conn_id.to_string(), sender)]) == 0 {
            return Err(SyncError::Transport(format!(
                "connection {conn_id} could not accept message"
            )));
        }
        Ok(())
    }

    fn subscribe(&self, conn_id: &str, channel: &str) -> Result<()> {
        let mut state = self.write();
        let entry = state
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| SyncError::Transport(format!("unknown connection {conn_id}")))?;
        entry.channels.insert(channel.to_string());
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id.to_string());
        log::debug!("Connection {conn_id} subscribed to {channel}");
        Ok(())
    }

    fn unsubscribe(&self, conn_id: &str, channel: &str) -> Result<()> {
        let mut state = self.write();
        let entry = state
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| SyncError::Transport(format!("unknown connection {conn_id}")))?;
        entry.channels.remove(channel);
        if let Some(members) = state.channels.get_mut(channel) {
            members.remove(conn_id);
            if members.is_empty() {
                state.channels.remove(channel);
            }
        }
        log::debug!("Connection {conn_id} unsubscribed from {channel}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn connect(hub: &ConnectionHub, user: &str, session: &str) -> (String, mpsc::Receiver<Frame>) {
        let info = ConnectionInfo::new(user, session);
        let id = info.id.clone();
        (id, hub.register(info))
    }

    fn recv_type(rx: &mut mpsc::Receiver<Frame>) -> Option<MessageType> {
        rx.try_recv()
            .ok()
            .map(|frame| WireMessage::decode(&frame).unwrap().msg_type)
    }

    #[test]
    fn test_register_and_unregister() {
        let hub = ConnectionHub::new(8);
        let (a, _rx_a) = connect(&hub, "u1", "s1");
        let (_b, _rx_b) = connect(&hub, "u1", "s2");
        hub.subscribe(&a, "record_t").unwrap();

        let stats = hub.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.users, 1);
        assert_eq!(stats.channels, 1);
        assert_eq!(hub.user_connections("u1").len(), 2);

        assert!(hub.unregister(&a));
        assert!(!hub.unregister(&a));
        assert_eq!(hub.channel_size("record_t"), 0);
        assert_eq!(hub.stats().channels, 0);
    }

    #[test]
    fn test_channel_broadcast_with_exclusion() {
        let hub = ConnectionHub::new(8);
        let (a, mut rx_a) = connect(&hub, "u1", "s1");
        let (b, mut rx_b) = connect(&hub, "u2", "s2");
        let (_c, mut rx_c) = connect(&hub, "u3", "s3");
        hub.subscribe(&a, "record_t").unwrap();
        hub.subscribe(&b, "record_t").unwrap();

        let reached = hub.broadcast_to_channel("record_t", &WireMessage::new(MessageType::Op), &["s1"]);
        assert_eq!(reached, 1);
        assert_eq!(recv_type(&mut rx_a), None);
        assert_eq!(recv_type(&mut rx_b), Some(MessageType::Op));
        assert_eq!(recv_type(&mut rx_c), None);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = ConnectionHub::new(8);
        let (a, mut rx_a) = connect(&hub, "u1", "s1");
        hub.subscribe(&a, "ch").unwrap();
        hub.unsubscribe(&a, "ch").unwrap();
        assert_eq!(hub.broadcast_to_channel("ch", &WireMessage::pong(), &[]), 0);
        assert_eq!(recv_type(&mut rx_a), None);
    }

    #[test]
    fn test_broadcast_to_user_reaches_all_sessions() {
        let hub = ConnectionHub::new(8);
        let (_a, mut rx_a) = connect(&hub, "u1", "s1");
        let (_b, mut rx_b) = connect(&hub, "u1", "s2");
        let (_c, mut rx_c) = connect(&hub, "u2", "s3");

        assert_eq!(hub.broadcast_to_user("u1", &WireMessage::new(MessageType::Notification)), 2);
        assert_eq!(recv_type(&mut rx_a), Some(MessageType::Notification));
        assert_eq!(recv_type(&mut rx_b), Some(MessageType::Notification));
        assert_eq!(recv_type(&mut rx_c), None);
    }

    #[test]
    fn test_slow_consumer_is_dropped() {
        let hub = ConnectionHub::new(1);
        let (a, _rx_a) = connect(&hub, "u1", "s1");
        hub.subscribe(&a, "ch").unwrap();

        assert_eq!(hub.broadcast_to_channel("ch", &WireMessage::pong(), &[]), 1);
        assert_eq!(hub.broadcast_to_channel("ch", &WireMessage::pong(), &[]), 0);

        let stats = hub.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let hub = ConnectionHub::new(4);
        assert!(matches!(
            hub.send_to_connection("nope", &WireMessage::pong()),
            Err(SyncError::Transport(_))
        ));
        assert!(hub.subscribe("nope", "ch").is_err());
    }

    #[test]
    fn test_expire_stale() {
        let hub = ConnectionHub::new(4);
        let (a, _rx) = connect(&hub, "u1", "s1");
        assert!(hub.expire_stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hub.expire_stale(Duration::from_millis(5)), vec![a.clone()]);
        assert!(hub.connection(&a).is_none());
    }
}
