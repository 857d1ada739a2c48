//! Local radio byte-transport contract.
//!
//! The physical radio/BLE driver lives outside this repository; the mesh
//! stack consumes it through [`RadioTransport`]: raw frame bytes out via
//! `send`, raw frame bytes in via an owned channel receiver. The in-memory
//! [`ChannelRadio`] implements the same contract for wiring and tests.

use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// What happened to an outbound frame handed to the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame went out on the air
    Sent,
    /// Frame was queued behind duty-cycle or congestion limits
    Queued,
    /// The radio has no path toward the destination
    NoRoute,
}

/// Raw byte transport over the local radio link.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Hand one encoded frame to the radio. `destination` is a hint only;
    /// the radio may broadcast regardless.
    async fn send(&self, destination: Option<u64>, frame: Bytes)
        -> Result<SendOutcome, TransportError>;

    /// Take the inbound frame receiver. Yields each received frame's raw
    /// bytes exactly once; returns `None` after the first call.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;
}

/// In-memory radio endpoint linked to a peer endpoint.
pub struct ChannelRadio {
    peer_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl ChannelRadio {
    /// Create two linked endpoints: frames sent on one arrive on the other.
    pub fn pair() -> (ChannelRadio, ChannelRadio) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelRadio {
                peer_tx: b_tx,
                inbound_rx: Mutex::new(Some(a_rx)),
            },
            ChannelRadio {
                peer_tx: a_tx,
                inbound_rx: Mutex::new(Some(b_rx)),
            },
        )
    }
}

#[async_trait]
impl RadioTransport for ChannelRadio {
    async fn send(
        &self,
        destination: Option<u64>,
        frame: Bytes,
    ) -> Result<SendOutcome, TransportError> {
        trace!(?destination, len = frame.len(), "channel radio send");
        self.peer_tx
            .send(frame)
            .map(|_| SendOutcome::Sent)
            .map_err(|_| TransportError::Closed)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound_rx.lock().expect("inbound lock poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_radio_pair() {
        let (a, b) = ChannelRadio::pair();
        let mut b_inbound = b.take_inbound().unwrap();
        // The receiver can be taken only once
        assert!(b.take_inbound().is_none());

        let outcome = a.send(Some(7), Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(&b_inbound.recv().await.unwrap()[..], b"frame");
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_is_closed() {
        let (a, b) = ChannelRadio::pair();
        drop(b);
        let err = a.send(None, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
