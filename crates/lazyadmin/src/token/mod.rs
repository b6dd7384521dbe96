//! Hardware second-factor verification.
//!
//! Challenge-response over an elliptic-curve credential: a fresh 32-byte
//! challenge is asserted by the device and the returned signature is checked
//! against the stored SPKI-encoded P-256 public key. The signed message is
//! `authData || SHA-256(challenge)`, digested with SHA-256 before ECDSA
//! verification.

mod device;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Credential, User};

pub use device::{Assertion, DeviceError, DevicePort, Registration, UnavailableDevice};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user has no configured hardware credential")]
    NoCredential,
    #[error("no hardware token device found")]
    NoDevice,
    #[error("assertion credential id did not match the configured credential")]
    CredentialMismatch,
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

impl From<DeviceError> for AuthError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NoDevice => AuthError::NoDevice,
            other => AuthError::AssertionFailed(other.to_string()),
        }
    }
}

/// Verify one credential against the device. Holds the device for the whole
/// assertion; returns promptly when `cancel` fires.
pub async fn verify(
    credential: &Credential,
    device: &dyn DevicePort,
    cancel: &CancellationToken,
) -> Result<(), AuthError> {
    let expected_id = URL_SAFE_NO_PAD
        .decode(&credential.credential_id)
        .map_err(|e| AuthError::AssertionFailed(format!("decode credential id: {e}")))?;

    let mut challenge = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut challenge);

    let assertion = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(AuthError::AssertionFailed("assertion cancelled".into()));
        }
        res = device.assert(&credential.rp_id, &challenge, &expected_id) => res?,
    };

    if assertion.credential_id != expected_id {
        return Err(AuthError::CredentialMismatch);
    }

    verify_signature(&assertion, &credential.public_key, &challenge)
}

/// Verify the assertion signature against the stored public key. The key must
/// be a base64url SPKI document whose inner key is P-256.
fn verify_signature(
    assertion: &Assertion,
    public_key_b64: &str,
    challenge: &[u8],
) -> Result<(), AuthError> {
    let spki = URL_SAFE_NO_PAD
        .decode(public_key_b64)
        .map_err(|e| AuthError::AssertionFailed(format!("decode public key: {e}")))?;

    let key = VerifyingKey::from_public_key_der(&spki)
        .map_err(|_| AuthError::AssertionFailed("public key is not a P-256 ECDSA key".into()))?;

    let signature = Signature::from_der(&assertion.signature)
        .map_err(|e| AuthError::AssertionFailed(format!("decode signature: {e}")))?;

    let client_hash = Sha256::digest(challenge);
    let mut message = Vec::with_capacity(assertion.auth_data.len() + client_hash.len());
    message.extend_from_slice(&assertion.auth_data);
    message.extend_from_slice(&client_hash);

    key.verify(&message, &signature)
        .map_err(|_| AuthError::AssertionFailed("signature verification failed".into()))
}

/// Session- or task-entry gate: verify the user's first credential.
pub async fn require_second_factor(
    user: &User,
    device: &dyn DevicePort,
    cancel: &CancellationToken,
) -> Result<(), AuthError> {
    let credential = user.credentials.first().ok_or(AuthError::NoCredential)?;
    tracing::info!(
        user = %user.id,
        rp_id = %credential.rp_id,
        "hardware token assertion required, touch your key"
    );
    verify(credential, device, cancel).await
}
