//! Fan-out of the full list to every connected session.
//!
//! Each session owns a bounded outbound queue. A push snapshots the
//! registry under the read lock, releases it, then `try_send`s the same
//! pre-encoded frame into every queue:
//! ```text
//!            ┌──────────── registry (RwLock<HashMap>) ────────────┐
//! push(&[Item]) ─► encode once ─► snapshot senders ─► try_send each
//!                                                   ├─► session A ✓
//!                                                   ├─► session B ✗ (closed → pruned)
//!                                                   └─► session C ✓
//! ```
//! A full or closed queue only costs that one session its update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::Claims;
use crate::item::Item;
use crate::protocol::{HubMessage, ProtocolError};

/// Session identifier, assigned on successful connect.
pub type SessionId = Uuid;

/// What a connection task should do next on behalf of the hub.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-encoded frame to write to the socket
    Frame(Arc<Vec<u8>>),
    /// Close the channel (shutdown or forced disconnect)
    Close,
}

/// Registry entry for one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub claims: Claims,
    pub remote_addr: String,
}

struct SessionEntry {
    info: SessionInfo,
    tx: mpsc::Sender<Outbound>,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub pushes: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
}

/// Lock-free counters for the push path.
struct AtomicBroadcastStats {
    pushes: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            pushes: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// Set of connected sessions plus the push path to them.
pub struct BroadcastHub {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    /// Outbound queue depth per session
    queue_capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastHub {
    /// Create a hub whose sessions buffer up to `queue_capacity` frames.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a session. Returns its id and the queue the connection
    /// task drains.
    pub async fn register(
        &self,
        claims: Claims,
        remote_addr: impl Into<String>,
    ) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session_id = Uuid::new_v4();
        let info = SessionInfo {
            session_id,
            claims,
            remote_addr: remote_addr.into(),
        };
        self.sessions
            .write()
            .await
            .insert(session_id, SessionEntry { info, tx });
        (session_id, rx)
    }

    pub async fn unregister(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|entry| entry.info)
    }

    /// Push the list to every session, the caller's included.
    pub async fn push_items(&self, items: &[Item]) -> Result<PushReport, ProtocolError> {
        let encoded = Arc::new(HubMessage::push(items)?.encode()?);
        Ok(self.push_raw(encoded).await)
    }

    /// Deliver a pre-encoded frame to every session (best effort).
    pub async fn push_raw(&self, encoded: Arc<Vec<u8>>) -> PushReport {
        let targets: Vec<(SessionId, mpsc::Sender<Outbound>)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .map(|(id, entry)| (*id, entry.tx.clone()))
                .collect()
        };

        let mut report = PushReport::default();
        let mut closed = Vec::new();
        for (session_id, tx) in targets {
            match tx.try_send(Outbound::Frame(encoded.clone())) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Session {session_id} queue full, dropping push");
                    report.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Session {session_id} gone, pruning");
                    report.dropped += 1;
                    closed.push(session_id);
                }
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &closed {
                sessions.remove(id);
            }
        }

        self.atomic_stats.pushes.fetch_add(1, Ordering::Relaxed);
        self.atomic_stats
            .frames_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.atomic_stats
            .frames_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Ask one session's connection task to close the channel.
    pub async fn disconnect(&self, session_id: &SessionId) -> bool {
        let tx = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(|e| e.tx.clone())
        };
        match tx {
            Some(tx) => tx.send(Outbound::Close).await.is_ok(),
            None => false,
        }
    }

    /// Ask every session to close. Returns how many were signalled.
    pub async fn disconnect_all(&self) -> usize {
        let targets: Vec<mpsc::Sender<Outbound>> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(|e| e.tx.clone()).collect()
        };
        let mut signalled = 0;
        for tx in targets {
            if tx.send(Outbound::Close).await.is_ok() {
                signalled += 1;
            }
        }
        signalled
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            pushes: self.atomic_stats.pushes.load(Ordering::Relaxed),
            frames_delivered: self.atomic_stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            sub: "shopper".into(),
            iss: "test".into(),
            aud: "test".into(),
            iat: 0,
            exp: i64::MAX,
        }
    }

    fn decode_push(out: Outbound) -> Vec<Item> {
        match out {
            Outbound::Frame(bytes) => HubMessage::decode(&bytes).unwrap().as_push().unwrap(),
            Outbound::Close => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = BroadcastHub::new(8);
        let (id, _rx) = hub.register(claims(), "127.0.0.1:1").await;
        assert_eq!(hub.session_count().await, 1);
        assert!(hub.has_session(&id).await);

        let info = hub.unregister(&id).await.unwrap();
        assert_eq!(info.remote_addr, "127.0.0.1:1");
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_push_reaches_all_sessions() {
        let hub = BroadcastHub::new(8);
        let (_, mut rx1) = hub.register(claims(), "a").await;
        let (_, mut rx2) = hub.register(claims(), "b").await;
        let (_, mut rx3) = hub.register(claims(), "c").await;

        let items = vec![Item::new(1, "Milk", "1L", 1)];
        let report = hub.push_items(&items).await.unwrap();
        assert_eq!(report, PushReport { delivered: 3, dropped: 0 });

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(decode_push(rx.recv().await.unwrap()), items);
        }
    }

    #[tokio::test]
    async fn test_dead_session_does_not_block_others() {
        let hub = BroadcastHub::new(8);
        let (dead, rx_dead) = hub.register(claims(), "dead").await;
        let (_, mut rx1) = hub.register(claims(), "a").await;
        let (_, mut rx2) = hub.register(claims(), "b").await;
        drop(rx_dead);

        let items = vec![Item::new(1, "Bread", "2", 1)];
        let report = hub.push_items(&items).await.unwrap();
        assert_eq!(report, PushReport { delivered: 2, dropped: 1 });
        assert_eq!(decode_push(rx1.recv().await.unwrap()), items);
        assert_eq!(decode_push(rx2.recv().await.unwrap()), items);

        // Closed session was pruned from the registry.
        assert!(!hub.has_session(&dead).await);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_session() {
        let hub = BroadcastHub::new(1);
        let (slow, _rx_slow) = hub.register(claims(), "slow").await;
        let (_, mut rx_fast) = hub.register(claims(), "fast").await;

        hub.push_items(&[]).await.unwrap();
        rx_fast.recv().await.unwrap();

        let report = hub.push_items(&[]).await.unwrap();
        assert_eq!(report, PushReport { delivered: 1, dropped: 1 });
        assert!(hub.has_session(&slow).await);
    }

    #[tokio::test]
    async fn test_disconnect_all_sends_close() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx1) = hub.register(claims(), "a").await;
        let (_, mut rx2) = hub.register(claims(), "b").await;

        assert_eq!(hub.disconnect_all().await, 2);
        assert!(matches!(rx1.recv().await, Some(Outbound::Close)));
        assert!(matches!(rx2.recv().await, Some(Outbound::Close)));

        assert!(hub.disconnect(&id).await);
        assert!(!hub.disconnect(&Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let hub = BroadcastHub::new(8);
        let (_, _rx) = hub.register(claims(), "a").await;
        hub.push_items(&[]).await.unwrap();
        hub.push_items(&[]).await.unwrap();

        let stats = hub.stats().await;
        assert_eq!(stats.pushes, 2);
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.active_sessions, 1);
    }

    #[test]
    fn test_queue_capacity_minimum() {
        assert_eq!(BroadcastHub::new(0).queue_capacity(), 1);
    }
}
