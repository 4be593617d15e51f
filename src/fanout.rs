//! Stream fan-out: subscriber sets keyed by `StreamKey`, best-effort
//! broadcast, pruning of subscribers whose queues are gone or full.
//!
//! A key exists iff at least one subscriber is registered. Broadcast
//! snapshots the subscriber set before writing so the lock is never held
//! across a send; per-subscriber ordering holds because each tunnel's frames
//! are dispatched by a single reader task and each subscriber has one
//! ordered queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// The three streaming channels a session fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Terminal,
    Recording,
    Agent,
}

impl StreamKind {
    /// SSE event name for this channel.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Terminal => "terminal_output",
            Self::Recording => "recording_output",
            Self::Agent => "agent_event",
        }
    }

    /// Fan-out address for a tunnel/session pair.
    pub fn stream_key(self, tunnel_id: &str, session_id: &str) -> String {
        match self {
            Self::Terminal => format!("{tunnel_id}:{session_id}"),
            Self::Recording => format!("{tunnel_id}:{session_id}:recording"),
            Self::Agent => format!("{tunnel_id}:{session_id}:agent"),
        }
    }
}

/// What the hub pushes into a subscriber's queue.
#[derive(Debug, Clone)]
pub enum SubscriberMessage {
    /// One broadcast payload, already in subscriber wire shape.
    Event(Value),
    /// The hub is closing this subscriber; WebSocket holders send a close
    /// frame with the given code, SSE holders end the stream.
    Close(u16),
}

/// Per-subscriber queue depth. A subscriber that falls this far behind is
/// dropped rather than allowed to stall the channel.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

type SubscriberSet = HashMap<String, mpsc::Sender<SubscriberMessage>>;

/// Subscription sets for the terminal, recording, and agent channels.
pub struct FanoutHub {
    streams: RwLock<HashMap<(StreamKind, String), SubscriberSet>>,
    /// Payloads dropped due to slow or vanished subscribers.
    dropped: AtomicU64,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a subscriber queue sized for the hub.
    pub fn channel() -> (
        mpsc::Sender<SubscriberMessage>,
        mpsc::Receiver<SubscriberMessage>,
    ) {
        mpsc::channel(SUBSCRIBER_QUEUE_DEPTH)
    }

    /// Add a subscriber. Re-subscribing the same id replaces its queue, so
    /// repeated subscribes leave the set unchanged.
    pub async fn subscribe(
        &self,
        kind: StreamKind,
        stream_key: &str,
        subscriber_id: &str,
        tx: mpsc::Sender<SubscriberMessage>,
    ) {
        let mut streams = self.streams.write().await;
        streams
            .entry((kind, stream_key.to_string()))
            .or_default()
            .insert(subscriber_id.to_string(), tx);
        debug!(?kind, stream_key, subscriber_id, "Subscriber added");
    }

    /// Remove a subscriber; the key vanishes with its last subscriber.
    pub async fn unsubscribe(&self, kind: StreamKind, stream_key: &str, subscriber_id: &str) {
        let mut streams = self.streams.write().await;
        let entry_key = (kind, stream_key.to_string());
        if let Some(set) = streams.get_mut(&entry_key) {
            set.remove(subscriber_id);
            if set.is_empty() {
                streams.remove(&entry_key);
            }
        }
        debug!(?kind, stream_key, subscriber_id, "Subscriber removed");
    }

    /// Deliver `payload` to every live subscriber of the key. Best-effort: a
    /// failed write never blocks the others; the failing subscriber is
    /// unsubscribed. Returns the number of successful deliveries.
    pub async fn broadcast(&self, kind: StreamKind, stream_key: &str, payload: Value) -> usize {
        // Snapshot the set so no lock is held during sends.
        let snapshot: Vec<(String, mpsc::Sender<SubscriberMessage>)> = {
            let streams = self.streams.read().await;
            match streams.get(&(kind, stream_key.to_string())) {
                Some(set) => set
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, tx) in &snapshot {
            if tx
                .try_send(SubscriberMessage::Event(payload.clone()))
                .is_ok()
            {
                delivered += 1;
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                failed.push(id.clone());
            }
        }

        for id in failed {
            warn!(?kind, stream_key, subscriber_id = %id, "Subscriber write failed, pruning");
            self.unsubscribe(kind, stream_key, &id).await;
        }
        delivered
    }

    /// Subscribers currently registered for a key.
    pub async fn subscriber_count(&self, kind: StreamKind, stream_key: &str) -> usize {
        let streams = self.streams.read().await;
        streams
            .get(&(kind, stream_key.to_string()))
            .map_or(0, SubscriberSet::len)
    }

    /// Subscribers across all keys of one tunnel, per kind. Used by the
    /// admin listing.
    pub async fn counts_for_tunnel(&self, tunnel_id: &str) -> HashMap<StreamKind, usize> {
        let prefix = format!("{tunnel_id}:");
        let streams = self.streams.read().await;
        let mut counts = HashMap::new();
        for ((kind, key), set) in streams.iter() {
            if key.starts_with(&prefix) {
                *counts.entry(*kind).or_insert(0) += set.len();
            }
        }
        counts
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close every subscriber with code 1001 and clear all sets.
    pub async fn shutdown(&self) {
        let mut streams = self.streams.write().await;
        for set in streams.values() {
            for tx in set.values() {
                let _ = tx.try_send(SubscriberMessage::Close(1001));
            }
        }
        streams.clear();
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_keys() {
        assert_eq!(StreamKind::Terminal.stream_key("t", "s"), "t:s");
        assert_eq!(StreamKind::Recording.stream_key("t", "s"), "t:s:recording");
        assert_eq!(StreamKind::Agent.stream_key("t", "s"), "t:s:agent");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let hub = FanoutHub::new();
        let (tx1, mut rx1) = FanoutHub::channel();
        let (tx2, mut rx2) = FanoutHub::channel();
        hub.subscribe(StreamKind::Terminal, "t:s", "a", tx1).await;
        hub.subscribe(StreamKind::Terminal, "t:s", "b", tx2).await;

        let delivered = hub
            .broadcast(StreamKind::Terminal, "t:s", json!({"data": "hello"}))
            .await;
        assert_eq!(delivered, 2);
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                SubscriberMessage::Event(v) => assert_eq!(v["data"], "hello"),
                SubscriberMessage::Close(_) => panic!("unexpected close"),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_key_delivers_nothing() {
        let hub = FanoutHub::new();
        assert_eq!(
            hub.broadcast(StreamKind::Agent, "t:s:agent", json!({})).await,
            0
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_receives_no_further_broadcasts() {
        let hub = FanoutHub::new();
        let (tx, mut rx) = FanoutHub::channel();
        hub.subscribe(StreamKind::Recording, "t:s:recording", "a", tx)
            .await;
        hub.broadcast(StreamKind::Recording, "t:s:recording", json!({"n": 1}))
            .await;
        hub.unsubscribe(StreamKind::Recording, "t:s:recording", "a")
            .await;
        hub.broadcast(StreamKind::Recording, "t:s:recording", json!({"n": 2}))
            .await;

        assert!(matches!(
            rx.recv().await,
            Some(SubscriberMessage::Event(v)) if v["n"] == 1
        ));
        // Queue is empty and the key is gone, so nothing else arrives.
        assert!(rx.try_recv().is_err());
        assert_eq!(
            hub.subscriber_count(StreamKind::Recording, "t:s:recording")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let hub = FanoutHub::new();
        let (tx, _rx) = FanoutHub::channel();
        hub.subscribe(StreamKind::Terminal, "t:s", "a", tx.clone())
            .await;
        hub.subscribe(StreamKind::Terminal, "t:s", "a", tx).await;
        assert_eq!(hub.subscriber_count(StreamKind::Terminal, "t:s").await, 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let hub = FanoutHub::new();
        let (tx_dead, rx_dead) = FanoutHub::channel();
        let (tx_live, mut rx_live) = FanoutHub::channel();
        hub.subscribe(StreamKind::Terminal, "t:s", "dead", tx_dead)
            .await;
        hub.subscribe(StreamKind::Terminal, "t:s", "live", tx_live)
            .await;
        drop(rx_dead);

        let delivered = hub
            .broadcast(StreamKind::Terminal, "t:s", json!({"n": 1}))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_live.recv().await.is_some());
        assert_eq!(hub.subscriber_count(StreamKind::Terminal, "t:s").await, 1);
        assert_eq!(hub.dropped_total(), 1);
    }

    #[tokio::test]
    async fn test_broadcasts_preserve_order_per_subscriber() {
        let hub = FanoutHub::new();
        let (tx, mut rx) = FanoutHub::channel();
        hub.subscribe(StreamKind::Terminal, "t:s", "a", tx).await;
        for n in 0..10 {
            hub.broadcast(StreamKind::Terminal, "t:s", json!({"n": n}))
                .await;
        }
        for n in 0..10 {
            match rx.recv().await.unwrap() {
                SubscriberMessage::Event(v) => assert_eq!(v["n"], n),
                SubscriberMessage::Close(_) => panic!("unexpected close"),
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_and_clears() {
        let hub = FanoutHub::new();
        let (tx, mut rx) = FanoutHub::channel();
        hub.subscribe(StreamKind::Agent, "t:s:agent", "a", tx).await;
        hub.shutdown().await;
        assert!(matches!(
            rx.recv().await,
            Some(SubscriberMessage::Close(1001))
        ));
        assert_eq!(
            hub.subscriber_count(StreamKind::Agent, "t:s:agent").await,
            0
        );
    }

    #[tokio::test]
    async fn test_counts_for_tunnel() {
        let hub = FanoutHub::new();
        let (tx1, _r1) = FanoutHub::channel();
        let (tx2, _r2) = FanoutHub::channel();
        let (tx3, _r3) = FanoutHub::channel();
        hub.subscribe(StreamKind::Terminal, "t1:s1", "a", tx1).await;
        hub.subscribe(StreamKind::Terminal, "t1:s2", "b", tx2).await;
        hub.subscribe(StreamKind::Agent, "t2:s1:agent", "c", tx3).await;

        let counts = hub.counts_for_tunnel("t1").await;
        assert_eq!(counts.get(&StreamKind::Terminal), Some(&2));
        assert_eq!(counts.get(&StreamKind::Agent), None);
    }
}
