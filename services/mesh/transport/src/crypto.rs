//! Encryption collaborator seam.
//!
//! The cryptographic primitives live outside this repository. Routing and
//! framing treat envelopes as opaque bytes; only the application edges call
//! through this trait.

use crate::TransportError;

/// Opaque encrypt/decrypt collaborator.
pub trait MeshCrypto: Send + Sync {
    /// Seal `plaintext` for the holder of `recipient_key`.
    fn encrypt(&self, plaintext: &[u8], recipient_key: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Open `envelope` using the local key material and the sender's key.
    fn decrypt(
        &self,
        envelope: &[u8],
        local_key: &[u8],
        sender_key: &[u8],
    ) -> Result<Vec<u8>, TransportError>;
}

/// Passthrough implementation for tests and unencrypted deployments.
pub struct PlaintextCrypto;

impl MeshCrypto for PlaintextCrypto {
    fn encrypt(&self, plaintext: &[u8], _recipient_key: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(
        &self,
        envelope: &[u8],
        _local_key: &[u8],
        _sender_key: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        Ok(envelope.to_vec())
    }
}
