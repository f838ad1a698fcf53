//! Channel fanout: publish committed operations to named channels.
//!
//! ```text
//!   publish([record_t1, record_t1.r1], op)
//!        │
//!        ├── record_t1     ──► cb₁   cb₂        one task per callback
//!        └── record_t1.r1  ──► cb₃
//! ```
//!
//! Delivery is best-effort and concurrent: every callback runs in its own
//! task, isolated with `catch_unwind`, so a panicking or failing subscriber
//! is logged and never affects the others or the publisher. The publisher
//! does not wait for delivery.
//!
//! When no tokio runtime is present (plain threads, sync tests) each
//! delivery runs on a short-lived OS thread instead.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::error::{Result, SyncError};
use crate::types::RawOperation;

/// Subscriber callback: `(channel, operation)`.
pub type SubscriberFn = Arc<dyn Fn(&str, &RawOperation) -> Result<()> + Send + Sync>;

/// Distribution collaborator used by the submission pipeline.
pub trait PubSub: Send + Sync {
    fn subscribe(&self, channel: &str, callback: SubscriberFn) -> Result<()>;

    /// Drop every callback registered on `channel`.
    fn unsubscribe(&self, channel: &str) -> Result<()>;

    fn publish(&self, channels: &[String], op: &RawOperation) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Fanout counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub channels: usize,
    pub subscribers: usize,
    pub deliveries: u64,
    pub failures: u64,
    pub closed: bool,
}

#[derive(Default)]
struct AtomicFanoutStats {
    deliveries: AtomicU64,
    failures: AtomicU64,
}

#[derive(Default)]
struct FanoutState {
    subscribers: HashMap<String, Vec<SubscriberFn>>,
    closed: bool,
}

impl FanoutState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SyncError::Closed("pub/sub service"));
        }
        Ok(())
    }
}

/// In-process [`PubSub`].
#[derive(Default)]
pub struct MemoryPubSub {
    state: RwLock<FanoutState>,
    counters: Arc<AtomicFanoutStats>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn deliver(
    channel: Arc<str>,
    op: Arc<RawOperation>,
    callback: SubscriberFn,
    counters: Arc<AtomicFanoutStats>,
) {
    let job = move || {
        match catch_unwind(AssertUnwindSafe(|| callback(&channel, &op))) {
            Ok(Ok(())) => {
                counters.deliveries.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Subscriber on channel {channel} failed: {e}");
            }
            Err(payload) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "Subscriber on channel {channel} panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    };

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { job() });
        }
        Err(_) => {
            std::thread::spawn(job);
        }
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    pub fn stats(&self) -> FanoutStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        FanoutStats {
            channels: state.subscribers.len(),
            subscribers: state.subscribers.values().map(Vec::len).sum(),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    /// Wait until `channel` has at least one subscriber.
    pub async fn wait_for_subscribers(&self, channel: &str, timeout: Duration) -> Result<()> {
        let poll = async {
            loop {
                if self.is_closed() {
                    return Err(SyncError::Closed("pub/sub service"));
                }
                if self.subscriber_count(channel) > 0 {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SyncError::Timeout)?
    }
}

impl PubSub for MemoryPubSub {
    fn subscribe(&self, channel: &str, callback: SubscriberFn) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ensure_open()?;
        let subs = state.subscribers.entry(channel.to_string()).or_default();
        subs.push(callback);
        log::debug!("Subscribed to channel {channel} ({} subscribers)", subs.len());
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.ensure_open()?;
        state.subscribers.remove(channel);
        log::debug!("Unsubscribed from channel {channel}");
        Ok(())
    }

    fn publish(&self, channels: &[String], op: &RawOperation) -> Result<()> {
        // Snapshot the callbacks, then dispatch without holding the lock.
        let targets: Vec<(Arc<str>, Vec<SubscriberFn>)> = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.ensure_open()?;
            channels
                .iter()
                .filter_map(|ch| {
                    state
                        .subscribers
                        .get(ch)
                        .map(|subs| (Arc::from(ch.as_str()), subs.clone()))
                })
                .collect()
        };

        let op = Arc::new(op.clone());
        for (channel, callbacks) in targets {
            log::debug!("Publishing v{} to channel {channel} ({} subscribers)", op.v, callbacks.len());
            for callback in callbacks {
                deliver(channel.clone(), op.clone(), callback, self.counters.clone());
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.subscribers.clear();
        log::info!("Memory pub/sub service closed");
        Ok(())
    }
}
