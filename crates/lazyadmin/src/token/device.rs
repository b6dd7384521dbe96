//! Hardware token device capability.
//!
//! The verifier is oblivious to transport specifics; a [`DevicePort`] is
//! injected at construction time. [`UnavailableDevice`] is the default when
//! no hardware integration is linked into the build.

use async_trait::async_trait;
use thiserror::Error;

/// Assertion response returned by the device.
#[derive(Clone, Debug)]
pub struct Assertion {
    pub credential_id: Vec<u8>,
    pub auth_data: Vec<u8>,
    /// DER-encoded ECDSA signature.
    pub signature: Vec<u8>,
}

/// Registration response returned by the device. Both fields are base64url
/// text ready for the catalog or the user store.
#[derive(Clone, Debug)]
pub struct Registration {
    pub credential_id: String,
    /// base64url-encoded SPKI P-256 public key.
    pub public_key: String,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no hardware token device found")]
    NoDevice,
    #[error("device assertion failed: {0}")]
    Assertion(String),
    #[error("device registration failed: {0}")]
    Registration(String),
}

/// Capability to talk to a hardware credential.
#[async_trait]
pub trait DevicePort: Send + Sync {
    /// Ask the device to sign a challenge with the named credential.
    async fn assert(
        &self,
        rp_id: &str,
        challenge: &[u8],
        credential_id: &[u8],
    ) -> Result<Assertion, DeviceError>;

    /// Mint a new credential for (rp, user) on the device.
    async fn register(
        &self,
        rp_id: &str,
        rp_name: &str,
        user_name: &str,
        user_id: &[u8],
    ) -> Result<Registration, DeviceError>;
}

/// Stub used when no device integration is linked at build time.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableDevice;

#[async_trait]
impl DevicePort for UnavailableDevice {
    async fn assert(
        &self,
        _rp_id: &str,
        _challenge: &[u8],
        _credential_id: &[u8],
    ) -> Result<Assertion, DeviceError> {
        Err(DeviceError::NoDevice)
    }

    async fn register(
        &self,
        _rp_id: &str,
        _rp_name: &str,
        _user_name: &str,
        _user_id: &[u8],
    ) -> Result<Registration, DeviceError> {
        Err(DeviceError::NoDevice)
    }
}
