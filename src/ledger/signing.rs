//! Ed25519 signing of submitted operations.
//!
//! The gateway verifies the signature against the public key and the
//! sender address before forwarding the operation to the ledger.

use ed25519_dalek::{Signer, SigningKey};
use serde::Serialize;

/// A signed operation ready for the wire.
#[derive(Debug, Clone, Serialize)]
pub struct SignedEnvelope<T: Serialize> {
    pub payload: T,
    /// Hex-encoded 64-byte signature over the canonical payload bytes
    pub signature: String,
    /// Hex-encoded 32-byte public key
    pub public_key: String,
}

/// Sign the canonical JSON encoding of `payload`.
///
/// Canonical here means `serde_json::to_vec` of the payload struct, whose field
/// order is fixed by its declaration.
pub fn sign_payload<T: Serialize>(
    signing_key: &SigningKey,
    payload: T,
) -> Result<SignedEnvelope<T>, serde_json::Error> {
    let message = serde_json::to_vec(&payload)?;
    let signature = signing_key.sign(&message);

    Ok(SignedEnvelope {
        payload,
        signature: hex::encode(signature.to_bytes()),
        public_key: hex::encode(signing_key.verifying_key().as_bytes()),
    })
}

/// Verify an envelope produced by [`sign_payload`].
#[cfg(test)]
pub fn verify_envelope<T: Serialize>(envelope: &SignedEnvelope<T>) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(message) = serde_json::to_vec(&envelope.payload) else {
        return false;
    };
    let Some(pk) = hex::decode(&envelope.public_key)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
    else {
        return false;
    };
    let Some(sig) = hex::decode(&envelope.signature)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b.as_slice()).ok())
    else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    key.verify(&message, &Signature::from_bytes(&sig)).is_ok()
}
