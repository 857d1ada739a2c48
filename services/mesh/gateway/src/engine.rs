//! The relay engine: accepts jobs from the mesh, executes them against
//! external services, and mirrors outcomes back.

use crate::job::{unix_now, JobStatus, JobType, RelayJob};
use crate::peers::PeerTable;
use crate::services::RelayServices;
use crate::stats::{GatewayStats, GatewayStatsSnapshot};
use crate::GatewayError;
use bytes::Bytes;
use dashmap::DashMap;
use ember_storage::{KeyedStore, NS_RELAY_JOB};
use ember_transport::{Backbone, QoS};
use ember_wire::{node_alias, ChunkKind, MAX_PAYLOAD_SIZE};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether this node offers relay services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Relay engine disabled; every submission is rejected
    Client,
    /// Relay jobs accepted and announced
    Gateway,
}

/// Gateway engine configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Operating mode
    pub mode: GatewayMode,
    /// Local node id, used in topics and announcements
    pub node_id: u64,
    /// Topic prefix for announcements and job status
    pub topic_prefix: String,
    /// Job types accepted at submission
    pub enabled: HashSet<JobType>,
    /// Deadline for one service call
    pub job_timeout: Duration,
    /// Retry budget for idempotent job types
    pub max_retries: u32,
    /// Terminal jobs older than this leave the log
    pub job_retention: Duration,
    /// Hard cap on retained jobs
    pub max_jobs: usize,
    /// Peer staleness timeout
    pub peer_timeout: Duration,
    /// Background sweep period
    pub sweep_interval: Duration,
}

impl GatewayConfig {
    /// Disabled-engine configuration for client nodes.
    pub fn client(node_id: u64) -> Self {
        Self {
            mode: GatewayMode::Client,
            enabled: HashSet::new(),
            ..Self::gateway(node_id)
        }
    }

    /// Gateway configuration with every service enabled.
    pub fn gateway(node_id: u64) -> Self {
        Self {
            mode: GatewayMode::Gateway,
            node_id,
            topic_prefix: "ember/gateway".to_string(),
            enabled: JobType::ALL.into_iter().collect(),
            job_timeout: Duration::from_secs(30),
            max_retries: 2,
            job_retention: Duration::from_secs(900),
            max_jobs: 256,
            peer_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A relay request arriving off the mesh
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Which service the request targets
    pub job_type: JobType,
    /// Requesting mesh node
    pub source_node: u64,
    /// Request payload
    pub payload: Vec<u8>,
}

struct JobEntry {
    job: RelayJob,
    touched: Instant,
}

struct Inner {
    config: GatewayConfig,
    enabled: RwLock<HashSet<JobType>>,
    jobs: DashMap<Uuid, JobEntry>,
    order: Mutex<VecDeque<Uuid>>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    services: RelayServices,
    store: Option<Arc<dyn KeyedStore>>,
    storage_degraded: AtomicBool,
    backbone: Option<Arc<dyn Backbone>>,
    outcomes: mpsc::UnboundedSender<RelayJob>,
    stats: GatewayStats,
    peers: PeerTable,
    worker: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn alias(&self) -> String {
        node_alias(self.config.node_id)
    }

    fn announce_topic(&self) -> String {
        format!("{}/announce/{}", self.config.topic_prefix, self.alias())
    }

    fn status_topic(&self, id: Uuid) -> String {
        format!("{}/{}/jobs/{}", self.config.topic_prefix, self.alias(), id)
    }

    fn reassembled_topic(&self) -> String {
        format!("{}/{}/reassembled", self.config.topic_prefix, self.alias())
    }

    async fn persist(&self, job: &RelayJob) {
        let Some(store) = &self.store else { return };
        let value = match serde_json::to_vec(job) {
            Ok(v) => v,
            Err(e) => {
                warn!("relay job failed to serialize: {e}");
                return;
            }
        };
        if let Err(e) = store
            .upsert(NS_RELAY_JOB, &job.id.to_string(), &value)
            .await
        {
            if !self.storage_degraded.swap(true, Ordering::Relaxed) {
                warn!("relay-job persistence unavailable, tracking in memory only: {e}");
            }
        }
    }

    async fn remove_persisted(&self, id: Uuid) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.remove(NS_RELAY_JOB, &id.to_string()).await {
            if !self.storage_degraded.swap(true, Ordering::Relaxed) {
                warn!("relay-job persistence unavailable, tracking in memory only: {e}");
            }
        }
    }

    async fn publish_status(&self, job: &RelayJob) {
        let Some(backbone) = &self.backbone else { return };
        let body = match serde_json::to_vec(job) {
            Ok(b) => b,
            Err(e) => {
                warn!("relay job status failed to serialize: {e}");
                return;
            }
        };
        if let Err(e) = backbone
            .publish(
                &self.status_topic(job.id),
                Bytes::from(body),
                QoS::AtLeastOnce,
                false,
            )
            .await
        {
            warn!(job = %job.id, "status publish failed: {e}");
        }
    }

    async fn announce(&self) {
        let Some(backbone) = &self.backbone else { return };
        let mut capabilities: Vec<&str> = self
            .enabled
            .read()
            .expect("enabled lock poisoned")
            .iter()
            .map(|t| t.as_str())
            .collect();
        capabilities.sort_unstable();

        let body = serde_json::json!({
            "node": self.config.node_id,
            "alias": self.alias(),
            "capabilities": capabilities,
            "ts": unix_now(),
        });
        if let Err(e) = backbone
            .publish(
                &self.announce_topic(),
                Bytes::from(body.to_string()),
                QoS::AtLeastOnce,
                true,
            )
            .await
        {
            warn!("capability announce failed: {e}");
        } else {
            info!(topic = %self.announce_topic(), "announced gateway capabilities");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for guard in [&self.worker, &self.sweeper] {
            if let Ok(mut handle) = guard.lock() {
                if let Some(handle) = handle.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Executes relay jobs bridging mesh traffic to external services.
///
/// Cheap to clone; all clones share one job log and worker.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<Inner>,
}

impl RelayEngine {
    /// Create an engine. Returns the engine plus the receiver of terminal
    /// job outcomes the node mirrors back onto the mesh.
    pub fn new(
        config: GatewayConfig,
        services: RelayServices,
        store: Option<Arc<dyn KeyedStore>>,
        backbone: Option<Arc<dyn Backbone>>,
    ) -> (RelayEngine, mpsc::UnboundedReceiver<RelayJob>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let enabled = RwLock::new(config.enabled.clone());
        let peers = PeerTable::with_timeout(config.peer_timeout);
        let inner = Arc::new(Inner {
            config,
            enabled,
            jobs: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            queue_tx,
            services,
            store,
            storage_degraded: AtomicBool::new(false),
            backbone,
            outcomes: outcome_tx,
            stats: GatewayStats::new(),
            peers,
            worker: Mutex::new(None),
            sweeper: Mutex::new(None),
        });

        let worker = tokio::spawn(worker_loop(Arc::downgrade(&inner), queue_rx));
        *inner.worker.lock().expect("worker lock poisoned") = Some(worker);
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        *inner.sweeper.lock().expect("sweeper lock poisoned") = Some(sweeper);

        (RelayEngine { inner }, outcome_rx)
    }

    /// Activate the gateway: reset counters, restart the uptime clock, and
    /// publish a retained capability announcement.
    pub async fn activate(&self) {
        self.inner.stats.reset();
        self.inner.announce().await;
        info!(node = self.inner.config.node_id, "gateway activated");
    }

    /// Submit a relay request.
    ///
    /// Client mode and disabled services are rejected here: no job record
    /// is created, so a rejected request can never reach `Processing`.
    pub fn submit(&self, request: RelayRequest) -> Result<Uuid, GatewayError> {
        if self.inner.config.mode != GatewayMode::Gateway {
            return Err(GatewayError::NotGateway);
        }
        if !self
            .inner
            .enabled
            .read()
            .expect("enabled lock poisoned")
            .contains(&request.job_type)
        {
            return Err(GatewayError::ServiceDisabled(request.job_type));
        }

        let job = RelayJob::new(
            request.job_type,
            request.source_node,
            request.payload,
            self.inner.config.max_retries,
        );
        let id = job.id;

        self.inner.peers.upsert(request.source_node, unix_now());
        self.inner.jobs.insert(
            id,
            JobEntry {
                job,
                touched: Instant::now(),
            },
        );
        self.inner
            .order
            .lock()
            .expect("order lock poisoned")
            .push_back(id);
        self.inner
            .queue_tx
            .send(id)
            .map_err(|_| GatewayError::QueueClosed)?;

        debug!(job = %id, job_type = %request.job_type, source = request.source_node, "relay job queued");
        Ok(id)
    }

    /// Cancel a job by id, synchronously marking it failed. A job already
    /// terminal is reported as such; an in-flight service call is left to
    /// finish but its outcome is discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<(), GatewayError> {
        let job = {
            let Some(mut entry) = self.inner.jobs.get_mut(&id) else {
                return Err(GatewayError::JobNotFound(id));
            };
            entry.job.transition(JobStatus::Failed)?;
            entry.job.error = Some("cancelled".to_string());
            entry.touched = Instant::now();
            entry.job.clone()
        };
        self.inner.persist(&job).await;
        let _ = self.inner.outcomes.send(job);
        info!(job = %id, "relay job cancelled");
        Ok(())
    }

    /// Enable or disable one service and republish the capability set.
    pub async fn set_service_enabled(&self, job_type: JobType, enabled: bool) {
        {
            let mut set = self.inner.enabled.write().expect("enabled lock poisoned");
            if enabled {
                set.insert(job_type);
            } else {
                set.remove(&job_type);
            }
        }
        if self.inner.config.mode == GatewayMode::Gateway {
            self.inner.announce().await;
        }
    }

    /// Whether a service currently accepts jobs.
    pub fn is_enabled(&self, job_type: JobType) -> bool {
        self.inner
            .enabled
            .read()
            .expect("enabled lock poisoned")
            .contains(&job_type)
    }

    /// Look up a job in the log.
    pub fn job(&self, id: Uuid) -> Option<RelayJob> {
        self.inner.jobs.get(&id).map(|e| e.job.clone())
    }

    /// Every job currently in the log.
    pub fn jobs_snapshot(&self) -> Vec<RelayJob> {
        self.inner.jobs.iter().map(|e| e.value().job.clone()).collect()
    }

    /// Counter snapshot.
    pub fn stats_snapshot(&self) -> GatewayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Peers served recently.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// The retained-announcement topic for this gateway.
    pub fn announce_topic(&self) -> String {
        self.inner.announce_topic()
    }

    /// The topic completed reassemblies are republished on.
    pub fn reassembled_topic(&self) -> String {
        self.inner.reassembled_topic()
    }

    /// Reload persisted jobs after a restart. Queued jobs re-enter the
    /// queue; interrupted `Processing` jobs re-run when idempotent and fail
    /// otherwise; terminal jobs re-populate the log.
    pub async fn recover(&self) -> Result<usize, GatewayError> {
        let Some(store) = &self.inner.store else {
            return Ok(0);
        };
        let records = store
            .scan(NS_RELAY_JOB)
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;

        let mut recovered = 0usize;
        for (key, value) in records {
            let mut job: RelayJob = match serde_json::from_slice(&value) {
                Ok(j) => j,
                Err(e) => {
                    warn!("dropping undecodable relay job '{key}': {e}");
                    store.remove(NS_RELAY_JOB, &key).await.ok();
                    continue;
                }
            };
            if self.inner.jobs.contains_key(&job.id) {
                continue;
            }

            let requeue = match job.status {
                JobStatus::Queued => true,
                JobStatus::Processing if job.job_type.is_idempotent() => {
                    job.status = JobStatus::Queued; // restart recovery path
                    true
                }
                JobStatus::Processing => {
                    job.status = JobStatus::Failed;
                    job.error = Some("interrupted by restart".to_string());
                    self.inner.persist(&job).await;
                    false
                }
                _ => false,
            };

            let id = job.id;
            self.inner.jobs.insert(
                id,
                JobEntry {
                    job,
                    touched: Instant::now(),
                },
            );
            self.inner
                .order
                .lock()
                .expect("order lock poisoned")
                .push_back(id);
            if requeue {
                self.inner
                    .queue_tx
                    .send(id)
                    .map_err(|_| GatewayError::QueueClosed)?;
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("re-queued {recovered} relay jobs from storage");
        }
        Ok(recovered)
    }
}

/// Split an oversized payload into encoded chunk payloads, each of which
/// fits one radio frame.
pub fn chunk_for_mesh(payload: &[u8], kind: ChunkKind) -> Result<Vec<Bytes>, ember_wire::WireError> {
    Ok(ember_wire::split(payload, kind, MAX_PAYLOAD_SIZE)?
        .iter()
        .map(|chunk| chunk.encode())
        .collect())
}

/// Single consumer draining the job queue so external calls never block
/// inbound frame processing.
async fn worker_loop(inner: std::sync::Weak<Inner>, mut queue_rx: mpsc::UnboundedReceiver<Uuid>) {
    while let Some(id) = queue_rx.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        process_job(&inner, id).await;
    }
}

async fn process_job(inner: &Arc<Inner>, id: Uuid) {
    // Claim the job; a cancellation that won the race leaves it non-Queued
    let job = {
        let Some(mut entry) = inner.jobs.get_mut(&id) else { return };
        if entry.job.status != JobStatus::Queued {
            return;
        }
        if entry.job.transition(JobStatus::Processing).is_err() {
            return;
        }
        entry.touched = Instant::now();
        entry.job.clone()
    };
    inner.persist(&job).await;
    debug!(job = %id, job_type = %job.job_type, "relay job processing");

    let mut retry_count = job.retry_count;
    let outcome = loop {
        let attempt = tokio::time::timeout(inner.config.job_timeout, dispatch(inner, &job)).await;
        let error = match attempt {
            Ok(Ok(reference)) => break Ok(reference),
            Ok(Err(e)) => e.to_string(),
            Err(_) => GatewayError::Timeout.to_string(),
        };
        if job.job_type.is_idempotent() && retry_count < job.max_retries {
            retry_count += 1;
            warn!(job = %id, retry = retry_count, "relay attempt failed, retrying: {error}");
            continue;
        }
        break Err(error);
    };

    // Terminal transition under the entry lock; cancel may have won
    let final_job = {
        let Some(mut entry) = inner.jobs.get_mut(&id) else { return };
        entry.job.retry_count = retry_count;
        let next = if outcome.is_ok() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if entry.job.transition(next).is_err() {
            return;
        }
        match &outcome {
            Ok(reference) => entry.job.result = Some(reference.clone()),
            Err(error) => entry.job.error = Some(error.clone()),
        }
        entry.touched = Instant::now();
        entry.job.clone()
    };

    inner.persist(&final_job).await;
    match final_job.status {
        JobStatus::Completed => {
            inner.stats.record_completed(
                final_job.job_type,
                final_job.payload.len() as u64,
                final_job.source_node,
            );
            info!(job = %id, job_type = %final_job.job_type, "relay job completed");
        }
        _ => {
            inner.stats.record_failed();
            warn!(job = %id, error = ?final_job.error, "relay job failed");
        }
    }
    inner.publish_status(&final_job).await;
    let _ = inner.outcomes.send(final_job);
}

async fn dispatch(inner: &Arc<Inner>, job: &RelayJob) -> Result<String, GatewayError> {
    match job.job_type {
        JobType::TxBroadcast => {
            let backend = inner
                .services
                .broadcaster
                .as_ref()
                .ok_or_else(|| GatewayError::Backend("no broadcast backend".into()))?;
            backend.broadcast_transaction(&job.payload).await
        }
        JobType::CashuRelay => {
            let backend = inner
                .services
                .ecash
                .as_ref()
                .ok_or_else(|| GatewayError::Backend("no ecash backend".into()))?;
            backend.relay_token(&job.payload).await
        }
        JobType::CashuRedeem => {
            let backend = inner
                .services
                .ecash
                .as_ref()
                .ok_or_else(|| GatewayError::Backend("no ecash backend".into()))?;
            backend.redeem_token(&job.payload).await
        }
        JobType::PaymentForward => {
            let backend = inner
                .services
                .payments
                .as_ref()
                .ok_or_else(|| GatewayError::Backend("no payment backend".into()))?;
            backend.forward_payment(&job.payload).await
        }
        JobType::ChunkReassembly => {
            let backbone = inner
                .backbone
                .as_ref()
                .ok_or_else(|| GatewayError::Backend("no backbone".into()))?;
            backbone
                .publish(
                    &inner.reassembled_topic(),
                    Bytes::from(job.payload.clone()),
                    QoS::AtLeastOnce,
                    false,
                )
                .await
                .map_err(|e| GatewayError::Backend(e.to_string()))?;
            Ok("republished".to_string())
        }
    }
}

/// Background sweep: age- and size-bound the job log, drop stale peers.
async fn sweep_loop(inner: std::sync::Weak<Inner>) {
    let interval = {
        let Some(inner) = inner.upgrade() else { return };
        inner.config.sweep_interval
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };

        let retention = inner.config.job_retention;
        let mut evict: Vec<Uuid> = inner
            .jobs
            .iter()
            .filter(|e| e.value().job.status.is_terminal() && e.value().touched.elapsed() > retention)
            .map(|e| *e.key())
            .collect();

        // Size cap: oldest terminal jobs leave first
        if inner.jobs.len() - evict.len() > inner.config.max_jobs {
            let order = inner.order.lock().expect("order lock poisoned");
            let mut excess = inner.jobs.len() - evict.len() - inner.config.max_jobs;
            for id in order.iter() {
                if excess == 0 {
                    break;
                }
                if evict.contains(id) {
                    continue;
                }
                let terminal = inner
                    .jobs
                    .get(id)
                    .map(|e| e.job.status.is_terminal())
                    .unwrap_or(false);
                if terminal {
                    evict.push(*id);
                    excess -= 1;
                }
            }
        }

        for id in evict {
            if inner.jobs.remove(&id).is_some() {
                debug!(job = %id, "evicting job from log");
                inner.remove_persisted(id).await;
            }
        }
        inner
            .order
            .lock()
            .expect("order lock poisoned")
            .retain(|id| inner.jobs.contains_key(id));

        inner.peers.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{BroadcastService, EcashService, PaymentService};
    use async_trait::async_trait;
    use ember_storage::MemoryStore;
    use ember_transport::LoopbackBackbone;
    use ember_wire::ChunkHeader;
    use std::sync::atomic::AtomicU32;

    struct OkBroadcaster;

    #[async_trait]
    impl BroadcastService for OkBroadcaster {
        async fn broadcast_transaction(&self, _tx: &[u8]) -> Result<String, GatewayError> {
            Ok("txid-1".to_string())
        }
    }

    struct FlakyBroadcaster {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl BroadcastService for FlakyBroadcaster {
        async fn broadcast_transaction(&self, _tx: &[u8]) -> Result<String, GatewayError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::Backend("mempool unavailable".into()));
            }
            Ok("txid-2".to_string())
        }
    }

    struct DownPayments;

    #[async_trait]
    impl PaymentService for DownPayments {
        async fn forward_payment(&self, _request: &[u8]) -> Result<String, GatewayError> {
            Err(GatewayError::Backend("processor down".into()))
        }
    }

    struct StuckPayments;

    #[async_trait]
    impl PaymentService for StuckPayments {
        async fn forward_payment(&self, _request: &[u8]) -> Result<String, GatewayError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("never".to_string())
        }
    }

    struct NoopEcash;

    #[async_trait]
    impl EcashService for NoopEcash {
        async fn relay_token(&self, _token: &[u8]) -> Result<String, GatewayError> {
            Ok("relayed".to_string())
        }

        async fn redeem_token(&self, _token: &[u8]) -> Result<String, GatewayError> {
            Ok("redeemed".to_string())
        }
    }

    fn fast_config(node_id: u64) -> GatewayConfig {
        GatewayConfig {
            job_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(3600),
            ..GatewayConfig::gateway(node_id)
        }
    }

    fn request(job_type: JobType) -> RelayRequest {
        RelayRequest {
            job_type,
            source_node: 0xC0FFEE,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[tokio::test]
    async fn test_client_mode_rejects_submissions() {
        let (engine, _outcomes) =
            RelayEngine::new(GatewayConfig::client(1), RelayServices::default(), None, None);
        assert!(matches!(
            engine.submit(request(JobType::TxBroadcast)),
            Err(GatewayError::NotGateway)
        ));
        assert!(engine.jobs_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_service_rejected_at_submission() {
        let mut config = fast_config(1);
        config.enabled.remove(&JobType::CashuRedeem);
        let services = RelayServices {
            ecash: Some(Arc::new(NoopEcash)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(config, services, None, None);

        assert!(matches!(
            engine.submit(request(JobType::CashuRedeem)),
            Err(GatewayError::ServiceDisabled(JobType::CashuRedeem))
        ));
        // Never queued, so it can never reach Processing
        assert!(engine.jobs_snapshot().is_empty());
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_job_lifecycle_to_completed() {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let backbone = Arc::new(LoopbackBackbone::new());
        let mut status_rx = backbone.subscribe("ember/gateway/+/jobs/#").await.unwrap();
        let services = RelayServices {
            broadcaster: Some(Arc::new(OkBroadcaster)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(
            fast_config(1),
            services,
            Some(store.clone()),
            Some(backbone.clone()),
        );
        engine.activate().await;

        let id = engine.submit(request(JobType::TxBroadcast)).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.id, id);
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.result.as_deref(), Some("txid-1"));

        let snap = engine.stats_snapshot();
        assert_eq!(snap.relayed_jobs.get("tx_broadcast"), Some(&1));
        assert_eq!(snap.bytes_relayed, 4);
        assert_eq!(snap.peers_served, 1);
        assert_eq!(engine.peer_count(), 1);

        // Status mirrored on the backbone and outcome persisted
        let status = status_rx.recv().await.unwrap();
        let published: RelayJob = serde_json::from_slice(&status.payload).unwrap();
        assert_eq!(published.status, JobStatus::Completed);
        let persisted: RelayJob =
            serde_json::from_slice(&store.get(NS_RELAY_JOB, &id.to_string()).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_non_idempotent_job_fails_without_retry() {
        let services = RelayServices {
            payments: Some(Arc::new(DownPayments)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(fast_config(1), services, None, None);

        engine.submit(request(JobType::PaymentForward)).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
        assert!(outcome.error.as_deref().unwrap().contains("processor down"));
        assert_eq!(engine.stats_snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn test_idempotent_job_retries_to_success() {
        let services = RelayServices {
            broadcaster: Some(Arc::new(FlakyBroadcaster {
                failures_left: AtomicU32::new(2),
            })),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(fast_config(1), services, None, None);

        engine.submit(request(JobType::TxBroadcast)).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(outcome.result.as_deref(), Some("txid-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_processing_job_fails_by_timeout() {
        let services = RelayServices {
            payments: Some(Arc::new(StuckPayments)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(fast_config(1), services, None, None);

        engine.submit(request(JobType::PaymentForward)).unwrap();
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_job() {
        let services = RelayServices {
            payments: Some(Arc::new(StuckPayments)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) = RelayEngine::new(fast_config(1), services, None, None);

        // First job occupies the worker; second stays queued
        let stuck = engine.submit(request(JobType::PaymentForward)).unwrap();
        let queued = engine.submit(request(JobType::PaymentForward)).unwrap();
        tokio::task::yield_now().await;

        engine.cancel(queued).await.unwrap();
        let cancelled = engine.job(queued).unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));

        // Outcomes: the cancellation first, then the stuck job timing out
        let first = outcomes.recv().await.unwrap();
        assert_eq!(first.id, queued);
        let second = outcomes.recv().await.unwrap();
        assert_eq!(second.id, stuck);
        assert_eq!(second.status, JobStatus::Failed);

        // Cancelling a terminal job is an error, not a mutation
        assert!(matches!(
            engine.cancel(queued).await,
            Err(GatewayError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            engine.cancel(Uuid::new_v4()).await,
            Err(GatewayError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_announce_is_retained() {
        let backbone = Arc::new(LoopbackBackbone::new());
        let (engine, _outcomes) = RelayEngine::new(
            fast_config(5),
            RelayServices::default(),
            None,
            Some(backbone.clone()),
        );
        engine.activate().await;

        let topic = engine.announce_topic();
        let retained = backbone.retained(&topic).expect("announce must be retained");
        let body: serde_json::Value = serde_json::from_slice(&retained).unwrap();
        assert_eq!(body["node"], 5);
        assert!(body["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "tx_broadcast"));

        // Toggling a service republishes the set
        engine
            .set_service_enabled(JobType::TxBroadcast, false)
            .await;
        let retained = backbone.retained(&topic).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&retained).unwrap();
        assert!(!body["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "tx_broadcast"));
        assert!(!engine.is_enabled(JobType::TxBroadcast));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_log_age_eviction() {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let services = RelayServices {
            broadcaster: Some(Arc::new(OkBroadcaster)),
            ..RelayServices::default()
        };
        let config = GatewayConfig {
            job_retention: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(100),
            ..fast_config(1)
        };
        let (engine, mut outcomes) = RelayEngine::new(config, services, Some(store.clone()), None);

        let id = engine.submit(request(JobType::TxBroadcast)).unwrap();
        outcomes.recv().await.unwrap();
        assert!(engine.job(id).is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(engine.job(id).is_none());
        assert!(store.get(NS_RELAY_JOB, &id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_requeues_persisted_jobs() {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let queued = RelayJob::new(JobType::TxBroadcast, 42, vec![7], 2);
        store
            .upsert(
                NS_RELAY_JOB,
                &queued.id.to_string(),
                &serde_json::to_vec(&queued).unwrap(),
            )
            .await
            .unwrap();

        let services = RelayServices {
            broadcaster: Some(Arc::new(OkBroadcaster)),
            ..RelayServices::default()
        };
        let (engine, mut outcomes) =
            RelayEngine::new(fast_config(1), services, Some(store.clone()), None);
        assert_eq!(engine.recover().await.unwrap(), 1);

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.id, queued.id);
        assert_eq!(outcome.status, JobStatus::Completed);
    }

    #[test]
    fn test_chunk_for_mesh_fits_frames() {
        let payload = vec![0xAB; 500];
        let frames = chunk_for_mesh(&payload, ChunkKind::Cashu).unwrap();
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.len() <= MAX_PAYLOAD_SIZE);
            let (header, _) = ChunkHeader::parse(frame).unwrap();
            assert_eq!(header.kind, ChunkKind::Cashu);
        }
    }
}
