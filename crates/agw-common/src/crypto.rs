//! Device-auth signing for the connect handshake.
//!
//! A device proves possession of its Ed25519 key by signing a canonical,
//! pipe-joined description of the connect request together with the
//! gateway-issued nonce. The device id is the hex SHA-256 of the raw public
//! key, so the gateway can recompute it from the key alone.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::b64url;

/// Inputs to the canonical device-auth payload.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAuthParams<'a> {
    /// Device id (hex SHA-256 of the public key).
    pub device_id: &'a str,
    /// Client identifier from the connect request.
    pub client_id: &'a str,
    /// Client mode from the connect request.
    pub client_mode: &'a str,
    /// Requested role.
    pub role: &'a str,
    /// Requested scopes, in request order.
    pub scopes: &'a [String],
    /// Signing time in Unix milliseconds.
    pub signed_at_ms: u64,
    /// Pre-shared gateway token, if any.
    pub token: Option<&'a str>,
    /// Server-issued nonce. `None` produces a legacy `v1` payload.
    pub nonce: Option<&'a str>,
}

/// Builds the canonical payload string that gets signed.
///
/// # Examples
///
/// ```
/// use agw_common::crypto::{device_auth_payload, DeviceAuthParams};
/// let scopes = vec!["operator.admin".to_string()];
/// let payload = device_auth_payload(&DeviceAuthParams {
///     device_id: "dev",
///     client_id: "cli",
///     client_mode: "cli",
///     role: "operator",
///     scopes: &scopes,
///     signed_at_ms: 42,
///     token: None,
///     nonce: Some("n1"),
/// });
/// assert_eq!(payload, "v2|dev|cli|cli|operator|operator.admin|42||n1");
/// ```
#[must_use]
pub fn device_auth_payload(params: &DeviceAuthParams<'_>) -> String {
    let version = if params.nonce.is_some() { "v2" } else { "v1" };
    let signed_at = params.signed_at_ms.to_string();
    let scopes = params.scopes.join(",");
    let mut parts = vec![
        version,
        params.device_id,
        params.client_id,
        params.client_mode,
        params.role,
        scopes.as_str(),
        signed_at.as_str(),
        params.token.unwrap_or(""),
    ];
    if let Some(nonce) = params.nonce {
        parts.push(nonce);
    }
    parts.join("|")
}

/// Derives the stable device id from a public key.
#[must_use]
pub fn device_id(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Signs `payload` and returns the base64url signature.
#[must_use]
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> String {
    b64url::encode(&signing_key.sign(payload).to_bytes())
}

/// Verifies a base64url signature over `payload`.
///
/// Returns `false` on malformed input as well as on a bad signature.
#[must_use]
pub fn verify_device_signature(public_key: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = b64url::decode_key(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = b64url::decode(signature) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    verifying_key
        .verify(payload, &Signature::from_bytes(&sig_array))
        .is_ok()
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
