//! Wide-area publish/subscribe backbone contract.
//!
//! The broker itself is external infrastructure; the mesh stack only needs
//! a client view: publish with QoS/retain, subscribe with topic filters.
//! [`LoopbackBackbone`] implements the contract in-process for wiring and
//! tests, including retained-message replay to late subscribers.

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Delivery guarantee requested for a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Delivered at least once
    AtLeastOnce,
    /// Delivered exactly once
    ExactlyOnce,
}

/// One message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BackboneMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Message payload
    pub payload: Bytes,
    /// Whether this is a retained message replayed at subscribe time
    pub retained: bool,
}

/// Client view of the publish/subscribe backbone.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Publish `payload` on `topic`. A retained publication replaces the
    /// topic's retained message; an empty retained payload clears it.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribe to a topic filter. Matching retained messages are replayed
    /// immediately on the returned channel.
    async fn subscribe(
        &self,
        filter: &str,
    ) -> Result<mpsc::UnboundedReceiver<BackboneMessage>, TransportError>;
}

/// Match a topic against a filter with MQTT-style wildcards: `+` matches
/// one level, a trailing `#` matches the remainder.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process backbone for wiring and tests.
pub struct LoopbackBackbone {
    retained: DashMap<String, Bytes>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<BackboneMessage>)>>,
}

impl LoopbackBackbone {
    /// Create an empty in-process backbone.
    pub fn new() -> Self {
        Self {
            retained: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The retained payload for a topic, if any.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.retained.get(topic).map(|v| v.clone())
    }
}

impl Default for LoopbackBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for LoopbackBackbone {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        trace!(topic, len = payload.len(), retain, "loopback publish");
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }

        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|(filter, tx)| {
            if !topic_matches(filter, topic) {
                return true;
            }
            tx.send(BackboneMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                retained: false,
            })
            .is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
    ) -> Result<mpsc::UnboundedReceiver<BackboneMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay retained messages before the subscription goes live
        for entry in self.retained.iter() {
            if topic_matches(filter, entry.key()) {
                let _ = tx.send(BackboneMessage {
                    topic: entry.key().clone(),
                    payload: entry.value().clone(),
                    retained: true,
                });
            }
        }

        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push((filter.to_string(), tx));
        Ok(rx)
    }
}
