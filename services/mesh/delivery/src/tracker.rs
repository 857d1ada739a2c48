//! Pending-ack tracking with timeout, retry, and terminal status reporting.

use crate::pending::{DeliveryEvent, DeliveryStatus, PendingAck};
use crate::DeliveryError;
use bytes::Bytes;
use dashmap::DashMap;
use ember_storage::{KeyedStore, NS_PENDING_ACK};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivery tracker configuration
#[derive(Debug, Clone)]
pub struct AckConfig {
    /// How long to wait for an ACK before each retry
    pub ack_timeout: Duration,
    /// Timeout budget before a delivery fails
    pub max_retries: u32,
    /// How often the defensive sweep runs
    pub sweep_interval: Duration,
    /// Pending records older than this are failed by the sweep
    pub max_pending_age: Duration,
    /// Terminal statuses are dropped from the poll surface after this
    pub status_retention: Duration,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_retries: 3,
            sweep_interval: Duration::from_secs(60),
            max_pending_age: Duration::from_secs(300),
            status_retention: Duration::from_secs(300),
        }
    }
}

struct PendingEntry {
    record: PendingAck,
    registered_at: Instant,
    timer: JoinHandle<()>,
}

struct Inner {
    config: AckConfig,
    store: Option<Arc<dyn KeyedStore>>,
    storage_degraded: AtomicBool,
    pending: DashMap<u32, PendingEntry>,
    statuses: DashMap<u32, (DeliveryStatus, Instant)>,
    outbound: mpsc::UnboundedSender<Bytes>,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    async fn persist(&self, record: &PendingAck) {
        let Some(store) = &self.store else { return };
        let value = match serde_json::to_vec(record) {
            Ok(v) => v,
            Err(e) => {
                warn!("pending-ack record failed to serialize: {e}");
                return;
            }
        };
        if let Err(e) = store
            .upsert(NS_PENDING_ACK, &record.message_id.to_string(), &value)
            .await
        {
            if !self.storage_degraded.swap(true, Ordering::Relaxed) {
                warn!("pending-ack persistence unavailable, tracking in memory only: {e}");
            }
        }
    }

    async fn remove_persisted(&self, message_id: u32) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store
            .remove(NS_PENDING_ACK, &message_id.to_string())
            .await
        {
            if !self.storage_degraded.swap(true, Ordering::Relaxed) {
                warn!("pending-ack persistence unavailable, tracking in memory only: {e}");
            }
        }
    }

    fn report(&self, message_id: u32, conversation_id: &str, status: DeliveryStatus) {
        self.statuses.insert(message_id, (status, Instant::now()));
        let _ = self.events.send(DeliveryEvent {
            message_id,
            conversation_id: conversation_id.to_string(),
            status,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweep.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        for entry in self.pending.iter() {
            entry.value().timer.abort();
        }
    }
}

/// Pairs outbound frames with pending-ack records, retries on timeout, and
/// surfaces terminal status via events and polling — never via panics.
///
/// Cheap to clone; all clones share one pending table.
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<Inner>,
}

impl DeliveryTracker {
    /// Create a tracker. Returns the tracker plus the outbound-frame and
    /// delivery-event receivers the node wires to its transport and
    /// application sides.
    pub fn new(
        config: AckConfig,
        store: Option<Arc<dyn KeyedStore>>,
    ) -> (
        DeliveryTracker,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::UnboundedReceiver<DeliveryEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            store,
            storage_degraded: AtomicBool::new(false),
            pending: DashMap::new(),
            statuses: DashMap::new(),
            outbound: outbound_tx,
            events: event_tx,
            sweep: Mutex::new(None),
        });

        let sweep_handle = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        *inner.sweep.lock().expect("sweep lock poisoned") = Some(sweep_handle);

        (DeliveryTracker { inner }, outbound_rx, event_rx)
    }

    /// Register a pending ack for `frame` and dispatch it.
    ///
    /// The record is persisted first, so a crash between registration and
    /// transmission re-sends on recovery rather than losing the message.
    pub async fn send_with_ack(
        &self,
        frame: Bytes,
        message_id: u32,
        conversation_id: &str,
    ) -> Result<(), DeliveryError> {
        let now = unix_now();
        let record = PendingAck {
            message_id,
            conversation_id: conversation_id.to_string(),
            frame: frame.to_vec(),
            sent_at: now,
            retry_count: 0,
            max_retries: self.inner.config.max_retries,
            next_retry_at: now + self.inner.config.ack_timeout.as_secs(),
        };

        self.inner.persist(&record).await;
        self.inner
            .report(message_id, conversation_id, DeliveryStatus::Sending);
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| DeliveryError::ChannelClosed)?;

        let timer = tokio::spawn(retry_loop(Arc::downgrade(&self.inner), message_id));
        self.inner.pending.insert(
            message_id,
            PendingEntry {
                record,
                registered_at: Instant::now(),
                timer,
            },
        );

        debug!(message_id, conversation_id, "registered pending ack");
        Ok(())
    }

    /// Resolve a pending delivery with a matching ACK. A late or unknown
    /// ACK is a no-op. Returns whether anything was resolved.
    pub async fn handle_ack(&self, message_id: u32) -> bool {
        let Some((_, entry)) = self.inner.pending.remove(&message_id) else {
            debug!(message_id, "ack without pending record ignored");
            return false;
        };
        entry.timer.abort();
        self.inner.remove_persisted(message_id).await;
        self.inner.report(
            message_id,
            &entry.record.conversation_id,
            DeliveryStatus::Delivered,
        );
        debug!(message_id, "delivery acknowledged");
        true
    }

    /// Cancel a pending delivery by id, synchronously halting its retries.
    /// Returns whether a pending record existed.
    pub async fn cancel(&self, message_id: u32) -> bool {
        let Some((_, entry)) = self.inner.pending.remove(&message_id) else {
            return false;
        };
        entry.timer.abort();
        self.inner.remove_persisted(message_id).await;
        self.inner.statuses.remove(&message_id);
        info!(message_id, "pending delivery cancelled");
        true
    }

    /// Poll the status of a tracked message.
    pub fn status(&self, message_id: u32) -> Option<DeliveryStatus> {
        self.inner.statuses.get(&message_id).map(|s| s.0)
    }

    /// Number of in-flight deliveries.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Reload persisted pending records after a restart: each is re-sent
    /// immediately with its remaining retry budget and its timer re-armed.
    /// Returns how many deliveries were resumed.
    pub async fn recover(&self) -> Result<usize, DeliveryError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let records = store.scan(NS_PENDING_ACK).await?;

        let mut resumed = 0usize;
        for (key, value) in records {
            let record: PendingAck = match serde_json::from_slice(&value) {
                Ok(r) => r,
                Err(e) => {
                    warn!("dropping undecodable pending-ack record '{key}': {e}");
                    store.remove(NS_PENDING_ACK, &key).await.ok();
                    continue;
                }
            };
            if self.inner.pending.contains_key(&record.message_id) {
                continue;
            }

            self.inner.report(
                record.message_id,
                &record.conversation_id,
                DeliveryStatus::Sending,
            );
            self.inner
                .outbound
                .send(Bytes::from(record.frame.clone()))
                .map_err(|_| DeliveryError::ChannelClosed)?;

            let timer = tokio::spawn(retry_loop(Arc::downgrade(&self.inner), record.message_id));
            self.inner.pending.insert(
                record.message_id,
                PendingEntry {
                    record,
                    registered_at: Instant::now(),
                    timer,
                },
            );
            resumed += 1;
        }

        if resumed > 0 {
            info!("resumed {resumed} in-flight deliveries from storage");
        }
        Ok(resumed)
    }
}

/// Per-message timeout/retry task. Races ACK arrival through the pending
/// table's entry lock: whichever side removes the entry wins, the other
/// becomes a no-op.
async fn retry_loop(inner: std::sync::Weak<Inner>, message_id: u32) {
    loop {
        let timeout = {
            let Some(inner) = inner.upgrade() else { return };
            inner.config.ack_timeout
        };
        tokio::time::sleep(timeout).await;

        let Some(inner) = inner.upgrade() else { return };

        // Mutate the record under the entry lock, act after releasing it.
        let redispatch = match inner.pending.get_mut(&message_id) {
            None => return, // resolved while we slept
            Some(mut entry) => {
                entry.record.retry_count += 1;
                if entry.record.retry_count < entry.record.max_retries {
                    entry.record.next_retry_at =
                        unix_now() + inner.config.ack_timeout.as_secs();
                    Some(entry.record.clone())
                } else {
                    None
                }
            }
        };

        match redispatch {
            Some(record) => {
                debug!(
                    message_id,
                    retry = record.retry_count,
                    "ack timeout, re-dispatching frame"
                );
                inner.persist(&record).await;
                inner.report(
                    message_id,
                    &record.conversation_id,
                    DeliveryStatus::Sending,
                );
                if inner.outbound.send(Bytes::from(record.frame)).is_err() {
                    return;
                }
            }
            None => {
                // Budget exhausted; ACK may still have won the race
                if let Some((_, entry)) = inner.pending.remove(&message_id) {
                    warn!(
                        message_id,
                        retries = entry.record.retry_count,
                        "retry budget exhausted, delivery failed"
                    );
                    inner.remove_persisted(message_id).await;
                    inner.report(
                        message_id,
                        &entry.record.conversation_id,
                        DeliveryStatus::Failed,
                    );
                }
                return;
            }
        }
    }
}

/// Defensive sweep: fails pending records older than the bound even if a
/// timer never fired, and prunes stale terminal statuses.
async fn sweep_loop(inner: std::sync::Weak<Inner>) {
    let interval = {
        let Some(inner) = inner.upgrade() else { return };
        inner.config.sweep_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };

        let max_age = inner.config.max_pending_age;
        let expired: Vec<u32> = inner
            .pending
            .iter()
            .filter(|e| e.value().registered_at.elapsed() > max_age)
            .map(|e| *e.key())
            .collect();

        for message_id in expired {
            if let Some((_, entry)) = inner.pending.remove(&message_id) {
                entry.timer.abort();
                warn!(message_id, "sweeping expired pending ack");
                inner.remove_persisted(message_id).await;
                inner.report(
                    message_id,
                    &entry.record.conversation_id,
                    DeliveryStatus::Failed,
                );
            }
        }

        let retention = inner.config.status_retention;
        inner
            .statuses
            .retain(|_, (status, at)| !status.is_terminal() || at.elapsed() <= retention);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
