//! Radio-first frame sending with backbone fallback.

use crate::backbone::{Backbone, QoS};
use crate::radio::{RadioTransport, SendOutcome};
use crate::TransportError;
use bytes::Bytes;
use ember_wire::node_alias;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which backbone carried a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    /// Direct radio transmission
    Radio,
    /// Published on the pub/sub backbone
    Backbone,
}

/// Sends frames over the radio, falling back to the backbone's frame topic
/// when the radio has no route or fails outright.
pub struct TransportManager {
    radio: Arc<dyn RadioTransport>,
    backbone: Option<Arc<dyn Backbone>>,
    topic_prefix: String,
}

impl TransportManager {
    /// Create a manager. `topic_prefix` roots the backbone frame topics,
    /// e.g. `ember` publishes under `ember/frames/<alias>`.
    pub fn new(
        radio: Arc<dyn RadioTransport>,
        backbone: Option<Arc<dyn Backbone>>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            radio,
            backbone,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// The backbone topic carrying frames for `destination`.
    pub fn frame_topic(&self, destination: Option<u64>) -> String {
        match destination {
            Some(node) => format!("{}/frames/{}", self.topic_prefix, node_alias(node)),
            None => format!("{}/frames/broadcast", self.topic_prefix),
        }
    }

    /// Send one encoded frame, radio first.
    pub async fn send_frame(
        &self,
        destination: Option<u64>,
        frame: Bytes,
    ) -> Result<SendPath, TransportError> {
        match self.radio.send(destination, frame.clone()).await {
            Ok(SendOutcome::Sent) | Ok(SendOutcome::Queued) => return Ok(SendPath::Radio),
            Ok(SendOutcome::NoRoute) => {
                debug!(?destination, "radio has no route, trying backbone");
            }
            Err(e) => {
                warn!(?destination, error = %e, "radio send failed, trying backbone");
            }
        }

        let Some(backbone) = &self.backbone else {
            return Err(TransportError::NoRoute);
        };
        backbone
            .publish(&self.frame_topic(destination), frame, QoS::AtLeastOnce, false)
            .await?;
        Ok(SendPath::Backbone)
    }
}
