//! External service collaborators the gateway relays to.
//!
//! The actual payment, broadcast, and e-cash clients live outside this
//! repository; the engine calls them through these traits.

use crate::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;

/// Signed-transaction broadcast backend.
#[async_trait]
pub trait BroadcastService: Send + Sync {
    /// Broadcast a signed transaction; returns a backend reference (txid).
    async fn broadcast_transaction(&self, tx: &[u8]) -> Result<String, GatewayError>;
}

/// Cashu e-cash backend.
#[async_trait]
pub trait EcashService: Send + Sync {
    /// Forward a token toward its mint; returns a backend reference.
    async fn relay_token(&self, token: &[u8]) -> Result<String, GatewayError>;

    /// Redeem a token; returns a backend reference.
    async fn redeem_token(&self, token: &[u8]) -> Result<String, GatewayError>;
}

/// Payment forwarding backend.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Forward a payment request; returns a backend reference.
    async fn forward_payment(&self, request: &[u8]) -> Result<String, GatewayError>;
}

/// The collaborator set a gateway is wired with. Absent collaborators fail
/// their job types at execution time.
#[derive(Clone, Default)]
pub struct RelayServices {
    /// Transaction broadcast backend
    pub broadcaster: Option<Arc<dyn BroadcastService>>,
    /// E-cash backend
    pub ecash: Option<Arc<dyn EcashService>>,
    /// Payment forwarding backend
    pub payments: Option<Arc<dyn PaymentService>>,
}
