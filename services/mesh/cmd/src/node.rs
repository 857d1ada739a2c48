//! Node wiring: the single-consumer inbound loop tying the codec, routing
//! engine, delivery tracker, and gateway together.
//!
//! Inbound frames are handled one at a time, so the dedup cache and the
//! assembly table stay single-owner state with no locking.

use crate::{component_debug, component_info, component_warn};
use anyhow::Result;
use bytes::Bytes;
use ember_delivery::{DeliveryEvent, DeliveryStatus, DeliveryTracker, MessageIdAllocator};
use ember_gateway::{chunk_for_mesh, GatewayError, JobType, RelayEngine, RelayJob, RelayRequest};
use ember_routing::{MeshMessage, MessageKind, RoutingDecision, RoutingEngine};
use ember_transport::{BackboneMessage, MeshCrypto, TransportManager};
use ember_wire::{
    node_alias, ChunkHeader, ChunkKind, Flags, Frame, FrameType, Reassembler, BROADCAST_NODE,
    MAX_PAYLOAD_SIZE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Plaintext body of a [`MessageKind::RelayRequest`] envelope.
#[derive(Debug, Serialize, Deserialize)]
struct RelayRequestBody {
    /// Target service token, see [`JobType::parse`]
    service: String,
    /// Payload handed to the external service
    payload: Vec<u8>,
}

/// One mesh node: codec, routing, delivery, and gateway glued to the
/// transports.
pub struct MeshNode {
    node_id: u64,
    routing: RoutingEngine,
    reassembler: Reassembler,
    tracker: DeliveryTracker,
    allocator: MessageIdAllocator,
    transport: Arc<TransportManager>,
    gateway: RelayEngine,
    crypto: Arc<dyn MeshCrypto>,
}

impl MeshNode {
    /// Assemble a node from its parts.
    pub fn new(
        node_id: u64,
        routing: RoutingEngine,
        tracker: DeliveryTracker,
        allocator: MessageIdAllocator,
        transport: Arc<TransportManager>,
        gateway: RelayEngine,
        crypto: Arc<dyn MeshCrypto>,
    ) -> Self {
        Self {
            node_id,
            routing,
            reassembler: Reassembler::new(),
            tracker,
            allocator,
            transport,
            gateway,
            crypto,
        }
    }

    /// Send a text message with acknowledgment tracking. Oversized
    /// envelopes are split into chunk frames (sent without per-chunk acks;
    /// the stream completes or is evicted on the receiver).
    pub async fn send_text(&self, to: u64, text: &str) -> Result<u32> {
        let msg_id = self.allocator.next_id().await;
        let enc = self
            .crypto
            .encrypt(text.as_bytes(), to.to_be_bytes().as_ref())?;
        let envelope = self
            .routing
            .create_message(msg_id, to, MessageKind::Chat, String::new(), enc);
        let payload = envelope.to_bytes()?;

        if payload.len() <= MAX_PAYLOAD_SIZE {
            let mut flags = Flags::MULTI_HOP | Flags::ACK_REQUESTED;
            if to == BROADCAST_NODE {
                flags |= Flags::BROADCAST;
            }
            let frame = Frame::new(FrameType::Text, self.node_id, to, msg_id)
                .with_ttl(envelope.ttl)
                .with_flags(flags)
                .with_payload(Bytes::from(payload));
            self.tracker
                .send_with_ack(frame.encode()?, msg_id, &node_alias(to))
                .await?;
        } else {
            self.send_chunked(to, &payload, ChunkKind::Text).await?;
        }
        Ok(msg_id)
    }

    /// Split an oversized payload into chunk frames and send them.
    async fn send_chunked(&self, to: u64, payload: &[u8], kind: ChunkKind) -> Result<()> {
        for chunk_payload in chunk_for_mesh(payload, kind)? {
            let chunk_id = self.allocator.next_id().await;
            let frame = Frame::new(FrameType::Chunk, self.node_id, to, chunk_id)
                .with_ttl(self.routing.default_ttl())
                .with_payload(chunk_payload);
            let bytes = frame.encode()?;
            self.transport
                .send_frame(destination_hint(to), bytes)
                .await?;
        }
        Ok(())
    }

    /// Run the node loop until a shutdown signal arrives.
    pub async fn run(
        mut self,
        mut radio_inbound: mpsc::UnboundedReceiver<Bytes>,
        mut backbone_frames: Option<mpsc::UnboundedReceiver<BackboneMessage>>,
        mut tracker_outbound: mpsc::UnboundedReceiver<Bytes>,
        mut delivery_events: mpsc::UnboundedReceiver<DeliveryEvent>,
        mut job_outcomes: mpsc::UnboundedReceiver<RelayJob>,
    ) -> Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut housekeeping = tokio::time::interval(Duration::from_secs(60));

        info!("mesh node {} running", node_alias(self.node_id));
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
                Some(bytes) = radio_inbound.recv() => {
                    self.handle_inbound(&bytes).await;
                }
                Some(msg) = recv_opt(&mut backbone_frames) => {
                    self.handle_inbound(&msg.payload).await;
                }
                Some(frame) = tracker_outbound.recv() => {
                    self.forward_tracker_frame(frame).await;
                }
                Some(event) = delivery_events.recv() => {
                    self.log_delivery_event(event);
                }
                Some(job) = job_outcomes.recv() => {
                    self.mirror_job_outcome(job).await;
                }
                _ = housekeeping.tick() => {
                    let evicted = self.reassembler.evict_idle();
                    if evicted > 0 {
                        component_info!("chunk", "evicted {} stale chunk streams", evicted);
                    }
                    self.routing.purge_dedup();
                }
            }
        }

        let stats = self.routing.stats();
        info!(
            "mesh node stopping: delivered={} relayed={} dropped={}",
            stats.delivered, stats.relayed, stats.dropped
        );
        Ok(())
    }

    /// Decode one inbound buffer and dispatch it.
    async fn handle_inbound(&mut self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Corrupt frames are expected on a lossy link
                component_debug!("wire", "discarding corrupt frame: {}", e);
                return;
            }
        };

        match frame.frame_type {
            FrameType::Ack => match frame.acked_message_id() {
                Some(acked) => {
                    self.tracker.handle_ack(acked).await;
                }
                None => {
                    component_warn!(
                        "delivery",
                        "malformed ack frame from {}",
                        node_alias(frame.from_node)
                    );
                }
            },
            FrameType::Chunk => self.handle_chunk(frame).await,
            _ => self.handle_envelope(frame).await,
        }
    }

    async fn handle_chunk(&mut self, frame: Frame) {
        let (header, data) = match ChunkHeader::parse(&frame.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                component_warn!("chunk", "dropping chunk with bad preamble: {}", e);
                return;
            }
        };
        let stream_id = header.stream_id.clone();

        match self.reassembler.insert(header, data) {
            Ok(Some((kind, payload))) => {
                self.ack_if_requested(&frame).await;
                self.handle_completed_stream(kind, payload, frame.from_node)
                    .await;
            }
            Ok(None) => {
                if let Some((received, total)) = self.reassembler.progress(&stream_id) {
                    component_debug!("chunk", "stream {} at {}/{}", stream_id, received, total);
                }
                self.ack_if_requested(&frame).await;
            }
            Err(e) => {
                component_warn!("chunk", "dropping inconsistent chunk: {}", e);
            }
        }
    }

    /// Route a completed stream: internet-bound payloads become relay jobs,
    /// everything else is delivered (or republished when we are a gateway).
    async fn handle_completed_stream(&mut self, kind: ChunkKind, payload: Bytes, source: u64) {
        let job_type = match kind {
            ChunkKind::Cashu => JobType::CashuRelay,
            ChunkKind::Transaction => JobType::TxBroadcast,
            ChunkKind::Payment => JobType::PaymentForward,
            ChunkKind::Text | ChunkKind::Binary => JobType::ChunkReassembly,
        };

        match self.gateway.submit(RelayRequest {
            job_type,
            source_node: source,
            payload: payload.to_vec(),
        }) {
            Ok(id) => {
                component_info!(
                    "gateway",
                    "reassembled {} stream from {} became relay job {}",
                    kind,
                    node_alias(source),
                    id
                );
            }
            Err(GatewayError::NotGateway) => {
                component_info!(
                    "app",
                    "delivered {} byte {} payload from {}",
                    payload.len(),
                    kind,
                    node_alias(source)
                );
            }
            Err(e) => {
                component_warn!("gateway", "relay submission rejected: {}", e);
            }
        }
    }

    async fn handle_envelope(&mut self, frame: Frame) {
        let envelope = match MeshMessage::from_bytes(&frame.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                component_warn!(
                    "routing",
                    "protocol violation from {}, dropping: {}",
                    node_alias(frame.from_node),
                    e
                );
                return;
            }
        };

        match self.routing.decide(envelope) {
            RoutingDecision::Deliver(msg) => {
                self.deliver(msg, &frame).await;
            }
            RoutingDecision::Relay(relay) => {
                self.relay(relay, &frame).await;
            }
            RoutingDecision::DeliverAndRelay { local, relay } => {
                self.relay(relay, &frame).await;
                self.deliver(local, &frame).await;
            }
            RoutingDecision::Drop(reason) => {
                component_debug!("routing", "dropped envelope: {}", reason);
            }
        }
    }

    async fn deliver(&mut self, msg: MeshMessage, frame: &Frame) {
        self.ack_if_requested(frame).await;
        let sender = node_alias(msg.from);

        match msg.kind {
            MessageKind::RelayRequest => {
                let body: RelayRequestBody = match serde_json::from_slice(&msg.enc) {
                    Ok(body) => body,
                    Err(e) => {
                        component_warn!("gateway", "bad relay request from {}: {}", sender, e);
                        return;
                    }
                };
                let Some(job_type) = JobType::parse(&body.service) else {
                    component_warn!(
                        "gateway",
                        "relay request from {} names unknown service '{}'",
                        sender,
                        body.service
                    );
                    return;
                };
                match self.gateway.submit(RelayRequest {
                    job_type,
                    source_node: msg.from,
                    payload: body.payload,
                }) {
                    Ok(id) => component_info!("gateway", "accepted relay job {} from {}", id, sender),
                    Err(e) => component_warn!("gateway", "relay request from {} rejected: {}", sender, e),
                }
            }
            MessageKind::Chat => match self.crypto.decrypt(
                &msg.enc,
                self.node_id.to_be_bytes().as_ref(),
                msg.from_pubkey.as_bytes(),
            ) {
                Ok(plaintext) => {
                    component_info!(
                        "app",
                        "message from {}: {}",
                        sender,
                        String::from_utf8_lossy(&plaintext)
                    );
                }
                Err(e) => component_warn!("app", "undecryptable message from {}: {}", sender, e),
            },
            MessageKind::Cashu => {
                component_info!("app", "cashu token from {} ({} bytes)", sender, msg.enc.len());
            }
            MessageKind::RelayStatus => {
                component_info!(
                    "gateway",
                    "relay status from {}: {}",
                    sender,
                    String::from_utf8_lossy(&msg.enc)
                );
            }
            MessageKind::Announce => {
                component_info!("mesh", "announce from {}", sender);
            }
        }
    }

    /// Re-emit a relayed envelope. Transparent hop: the envelope already
    /// carries the decremented TTL; content is untouched.
    async fn relay(&self, relay: MeshMessage, frame: &Frame) {
        let payload = match relay.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                component_warn!("routing", "relay encode failed: {}", e);
                return;
            }
        };
        let out = Frame::new(frame.frame_type, frame.from_node, frame.to_node, frame.message_id)
            .with_ttl(relay.ttl)
            .with_flags(frame.flags | Flags::RELAY)
            .with_payload(Bytes::from(payload));

        match out.encode() {
            Ok(bytes) => {
                if let Err(e) = self
                    .transport
                    .send_frame(destination_hint(frame.to_node), bytes)
                    .await
                {
                    component_warn!("transport", "relay send failed: {}", e);
                }
            }
            Err(e) => component_warn!("routing", "relay frame encode failed: {}", e),
        }
    }

    /// Answer an ACK-requested frame addressed to this node.
    async fn ack_if_requested(&self, frame: &Frame) {
        if !frame.flags.contains(Flags::ACK_REQUESTED) || frame.to_node != self.node_id {
            return;
        }
        let ack_id = self.allocator.next_id().await;
        let ack = Frame::ack_for(frame, self.node_id, ack_id);
        match ack.encode() {
            Ok(bytes) => {
                if let Err(e) = self
                    .transport
                    .send_frame(Some(frame.from_node), bytes)
                    .await
                {
                    component_warn!("transport", "ack send failed: {}", e);
                }
            }
            Err(e) => component_warn!("delivery", "ack encode failed: {}", e),
        }
    }

    /// Frames the delivery tracker dispatches carry their own addressing.
    async fn forward_tracker_frame(&self, bytes: Bytes) {
        let destination = Frame::decode(&bytes)
            .ok()
            .map(|f| f.to_node)
            .and_then(destination_hint);
        if let Err(e) = self.transport.send_frame(destination, bytes).await {
            component_warn!("transport", "outbound send failed: {}", e);
        }
    }

    fn log_delivery_event(&self, event: DeliveryEvent) {
        match event.status {
            DeliveryStatus::Delivered => {
                component_info!(
                    "delivery",
                    "message {} to {} delivered",
                    event.message_id,
                    event.conversation_id
                );
            }
            DeliveryStatus::Failed => {
                component_warn!(
                    "delivery",
                    "message {} to {} failed",
                    event.message_id,
                    event.conversation_id
                );
            }
            DeliveryStatus::Sending => {
                component_debug!("delivery", "message {} sending", event.message_id);
            }
        }
    }

    /// Mirror a terminal relay-job outcome back to the requesting node.
    async fn mirror_job_outcome(&self, job: RelayJob) {
        let body = serde_json::json!({
            "id": job.id,
            "service": job.job_type.as_str(),
            "status": format!("{:?}", job.status).to_lowercase(),
            "result": job.result,
            "error": job.error,
        })
        .to_string();

        let msg_id = self.allocator.next_id().await;
        let envelope = self.routing.create_message(
            msg_id,
            job.source_node,
            MessageKind::RelayStatus,
            String::new(),
            body.into_bytes(),
        );
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                component_warn!("gateway", "status envelope encode failed: {}", e);
                return;
            }
        };

        let result = if payload.len() <= MAX_PAYLOAD_SIZE {
            let frame = Frame::new(FrameType::RelayStatus, self.node_id, job.source_node, msg_id)
                .with_ttl(envelope.ttl)
                .with_flags(Flags::MULTI_HOP)
                .with_payload(Bytes::from(payload));
            match frame.encode() {
                Ok(bytes) => self
                    .transport
                    .send_frame(destination_hint(job.source_node), bytes)
                    .await
                    .map(|_| ()),
                Err(e) => {
                    component_warn!("gateway", "status frame encode failed: {}", e);
                    return;
                }
            }
        } else {
            self.send_chunked(job.source_node, &payload, ChunkKind::Binary)
                .await
                .map_err(|_| ember_transport::TransportError::NoRoute)
        };

        if let Err(e) = result {
            component_warn!("gateway", "status mirror to {} failed: {}", node_alias(job.source_node), e);
        }
    }
}

fn destination_hint(to_node: u64) -> Option<u64> {
    if to_node == BROADCAST_NODE {
        None
    } else {
        Some(to_node)
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_delivery::AckConfig;
    use ember_gateway::{BroadcastService, GatewayConfig, JobStatus, RelayServices};
    use ember_storage::{KeyedStore, MemoryStore};
    use ember_transport::{ChannelRadio, PlaintextCrypto, RadioTransport};
    use ember_wire::parse_alias;

    struct OkBroadcaster;

    #[async_trait::async_trait]
    impl BroadcastService for OkBroadcaster {
        async fn broadcast_transaction(&self, _tx: &[u8]) -> Result<String, GatewayError> {
            Ok("txid-9".to_string())
        }
    }

    struct TestNode {
        node: MeshNode,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        tracker_outbound: mpsc::UnboundedReceiver<Bytes>,
        events: mpsc::UnboundedReceiver<DeliveryEvent>,
        outcomes: mpsc::UnboundedReceiver<RelayJob>,
    }

    async fn build_node(node_id: u64, radio: ChannelRadio, gateway_mode: bool) -> TestNode {
        let store: Arc<dyn KeyedStore> = Arc::new(MemoryStore::new());
        let inbound = radio.take_inbound().unwrap();
        let transport = Arc::new(TransportManager::new(Arc::new(radio), None, "ember"));

        let (tracker, tracker_outbound, events) =
            DeliveryTracker::new(AckConfig::default(), Some(store.clone()));
        let allocator = MessageIdAllocator::open(Some(store.clone())).await;

        let config = if gateway_mode {
            GatewayConfig::gateway(node_id)
        } else {
            GatewayConfig::client(node_id)
        };
        let services = RelayServices {
            broadcaster: Some(Arc::new(OkBroadcaster)),
            ..RelayServices::default()
        };
        let (gateway, outcomes) = RelayEngine::new(config, services, Some(store), None);

        let node = MeshNode::new(
            node_id,
            RoutingEngine::new(node_id),
            tracker,
            allocator,
            transport,
            gateway,
            Arc::new(PlaintextCrypto),
        );
        TestNode {
            node,
            inbound,
            tracker_outbound,
            events,
            outcomes,
        }
    }

    #[tokio::test]
    async fn test_text_round_trip_with_ack() {
        let (radio_a, radio_b) = ChannelRadio::pair();
        let mut a = build_node(0xA1, radio_a, false).await;
        let mut b = build_node(0xB2, radio_b, false).await;

        let msg_id = a.node.send_text(0xB2, "hello").await.unwrap();

        // Tracker dispatched the frame; A pushes it onto the radio
        let frame = a.tracker_outbound.recv().await.unwrap();
        assert_eq!(a.events.recv().await.unwrap().status, DeliveryStatus::Sending);
        a.node.forward_tracker_frame(frame).await;

        // B receives, delivers, and acks
        let at_b = b.inbound.recv().await.unwrap();
        b.node.handle_inbound(&at_b).await;
        assert_eq!(b.node.routing.stats().delivered, 1);

        // A receives the ack and resolves the delivery
        let ack = a.inbound.recv().await.unwrap();
        a.node.handle_inbound(&ack).await;
        let event = a.events.recv().await.unwrap();
        assert_eq!(event.message_id, msg_id);
        assert_eq!(event.status, DeliveryStatus::Delivered);

        // Redelivery of the same frame is suppressed by dedup
        b.node.handle_inbound(&at_b).await;
        assert_eq!(b.node.routing.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_relay_request_becomes_gateway_job() {
        let (radio_a, radio_b) = ChannelRadio::pair();
        let requester = build_node(0xA1, radio_a, false).await;
        let mut gateway_node = build_node(0xB2, radio_b, true).await;

        let body = serde_json::to_vec(&RelayRequestBody {
            service: "tx_broadcast".to_string(),
            payload: vec![0xDE, 0xAD],
        })
        .unwrap();
        let envelope = requester.node.routing.create_message(
            77,
            0xB2,
            MessageKind::RelayRequest,
            String::new(),
            body,
        );
        let frame = Frame::new(FrameType::RelayRequest, 0xA1, 0xB2, 77)
            .with_ttl(envelope.ttl)
            .with_flags(Flags::MULTI_HOP)
            .with_payload(Bytes::from(envelope.to_bytes().unwrap()));

        gateway_node
            .node
            .handle_inbound(&frame.encode().unwrap())
            .await;

        let outcome = gateway_node.outcomes.recv().await.unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.result.as_deref(), Some("txid-9"));
        assert_eq!(outcome.source_node, 0xA1);
    }

    #[tokio::test]
    async fn test_relay_hop_decrements_ttl_on_the_wire() {
        let (radio_a, radio_b) = ChannelRadio::pair();
        let mut hop = build_node(0xA1, radio_a, false).await;
        let far_end = radio_b;

        // Envelope addressed to somebody else entirely
        let envelope = MeshMessage::new(5, 0xC3, 0xD4, 6, MessageKind::Chat, String::new(), vec![1]);
        let frame = Frame::new(FrameType::Text, 0xC3, 0xD4, 5)
            .with_ttl(6)
            .with_flags(Flags::MULTI_HOP)
            .with_payload(Bytes::from(envelope.to_bytes().unwrap()));

        hop.node.handle_inbound(&frame.encode().unwrap()).await;

        let mut far_inbound = far_end.take_inbound().unwrap();
        let relayed_bytes = far_inbound.recv().await.unwrap();
        let relayed = Frame::decode(&relayed_bytes).unwrap();
        assert!(relayed.flags.contains(Flags::RELAY));
        let relayed_env = MeshMessage::from_bytes(&relayed.payload).unwrap();
        assert_eq!(relayed_env.ttl, 5);
        assert_eq!(relayed_env.hop_count, 1);
    }

    #[test]
    fn test_alias_parse_for_cli() {
        let alias = node_alias(0xB2);
        assert_eq!(parse_alias(&alias).unwrap(), 0xB2);
    }
}
