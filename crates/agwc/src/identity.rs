use agw_common::{b64url, crypto};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const KEY_FILE_PERMS: u32 = 0o600;
const IDENTITY_FILE_VERSION: u32 = 1;

/// Ed25519 device keypair plus its derived device id.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key: String,
    private_key: String,
    created_at_ms: u64,
}

impl DeviceIdentity {
    /// Wraps an existing signing key.
    #[must_use]
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = crypto::device_id(&signing_key.verifying_key());
        Self {
            signing_key,
            device_id,
        }
    }

    /// Generate a fresh identity using OS randomness.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Stable identifier: hex SHA-256 of the raw public key.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The public half of the keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Raw 32-byte private seed.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Public key in the base64url form the handshake expects.
    #[must_use]
    pub fn public_key_encoded(&self) -> String {
        b64url::encode(self.verifying_key().as_bytes())
    }

    /// Deterministic Ed25519 signature over `payload`, base64url encoded.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        crypto::sign_payload(&self.signing_key, payload)
    }
}

/// Loads the identity stored at `path`, creating and persisting a new one
/// when the file does not exist.
///
/// # Errors
///
/// Returns an error if the key file has wrong permissions, cannot be
/// parsed, or if file I/O fails.
pub fn load_or_create_identity(path: &Path) -> anyhow::Result<DeviceIdentity> {
    if !path.exists() {
        let identity = DeviceIdentity::generate();
        write_identity(path, &identity)?;
        info!(device_id = %identity.device_id(), path = %path.display(), "created device identity");
        return Ok(identity);
    }

    let metadata = fs::metadata(path)?;
    let permissions = metadata.permissions().mode();
    if permissions & 0o077 != 0 {
        anyhow::bail!(
            "identity file {} has overly permissive permissions ({:o}), must be 0600",
            path.display(),
            permissions & 0o777
        );
    }

    let raw = fs::read_to_string(path)?;
    let stored: StoredIdentity = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("identity file {} is malformed: {e}", path.display()))?;
    if stored.version != IDENTITY_FILE_VERSION {
        anyhow::bail!(
            "identity file {} has unsupported version {}",
            path.display(),
            stored.version
        );
    }

    let seed = b64url::decode_key(&stored.private_key)
        .map_err(|e| anyhow::anyhow!("identity file {} has a bad private key: {e}", path.display()))?;
    let identity = DeviceIdentity::from_signing_key(SigningKey::from_bytes(&seed));

    if stored.public_key != identity.public_key_encoded() {
        anyhow::bail!(
            "identity file {} public key does not match its private key",
            path.display()
        );
    }
    if stored.device_id != identity.device_id() {
        warn!(path = %path.display(), "stored device id does not match key, rewriting");
        write_identity(path, &identity)?;
    }

    Ok(identity)
}

fn write_identity(path: &Path, identity: &DeviceIdentity) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let stored = StoredIdentity {
        version: IDENTITY_FILE_VERSION,
        device_id: identity.device_id().to_string(),
        public_key: identity.public_key_encoded(),
        private_key: b64url::encode(&identity.secret_bytes()),
        created_at_ms: crypto::unix_now_ms(),
    };
    let mut body = serde_json::to_string_pretty(&stored)?;
    body.push('\n');

    // Create file with restrictive permissions atomically
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(KEY_FILE_PERMS)
        .open(path)?;
    file.write_all(body.as_bytes())?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_PERMS))?;
    Ok(())
}

/// Identities loaded in this process, keyed by file path.
///
/// Owned by the host and handed to whichever component needs a device
/// identity, so each key file is read at most once.
#[derive(Debug, Default, Clone)]
pub struct IdentityCache {
    entries: Arc<Mutex<HashMap<PathBuf, Arc<DeviceIdentity>>>>,
}

impl IdentityCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached identity for `path`, loading or creating it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`load_or_create_identity`].
    pub fn load(&self, path: &Path) -> anyhow::Result<Arc<DeviceIdentity>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("identity cache lock poisoned"))?;
        if let Some(identity) = entries.get(path) {
            return Ok(Arc::clone(identity));
        }
        let identity = Arc::new(load_or_create_identity(path)?);
        entries.insert(path.to_path_buf(), Arc::clone(&identity));
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_path() -> PathBuf {
        let random_suffix: u64 = rand::random();
        std::env::temp_dir().join(format!("agwc_test_{random_suffix}"))
    }

    #[test]
    fn test_load_creates_file_with_owner_only_permissions() {
        let test_dir = get_test_path();
        let key_path = test_dir.join("identity").join("device.json");
        let identity = load_or_create_identity(&key_path).unwrap();
        assert!(key_path.exists());
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(identity.device_id().len(), 64);
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_load_twice_returns_identical_keypair() {
        let test_dir = get_test_path();
        let key_path = test_dir.join("device.json");
        let first = load_or_create_identity(&key_path).unwrap();
        let second = load_or_create_identity(&key_path).unwrap();
        assert_eq!(first.secret_bytes(), second.secret_bytes());
        assert_eq!(first.public_key_encoded(), second.public_key_encoded());
        assert_eq!(first.device_id(), second.device_id());
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_different_paths_yield_different_keypairs() {
        let test_dir = get_test_path();
        let a = load_or_create_identity(&test_dir.join("a.json")).unwrap();
        let b = load_or_create_identity(&test_dir.join("b.json")).unwrap();
        assert_ne!(a.secret_bytes(), b.secret_bytes());
        assert_ne!(a.device_id(), b.device_id());
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_rejects_wrong_permissions() {
        let test_dir = get_test_path();
        let key_path = test_dir.join("device.json");
        load_or_create_identity(&key_path).unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = load_or_create_identity(&key_path).unwrap_err().to_string();
        assert!(err.contains("overly permissive permissions"));
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_rejects_malformed_file() {
        let test_dir = get_test_path();
        fs::create_dir_all(&test_dir).unwrap();
        let key_path = test_dir.join("device.json");
        fs::write(&key_path, "{ not json").unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).unwrap();
        let err = load_or_create_identity(&key_path).unwrap_err().to_string();
        assert!(err.contains("malformed"));
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_mismatched_device_id_is_rewritten() {
        let test_dir = get_test_path();
        let key_path = test_dir.join("device.json");
        let original = load_or_create_identity(&key_path).unwrap();

        let mut stored: StoredIdentity =
            serde_json::from_str(&fs::read_to_string(&key_path).unwrap()).unwrap();
        stored.device_id = "stale".to_string();
        fs::write(&key_path, serde_json::to_string(&stored).unwrap()).unwrap();

        let reloaded = load_or_create_identity(&key_path).unwrap();
        assert_eq!(reloaded.device_id(), original.device_id());
        let on_disk: StoredIdentity =
            serde_json::from_str(&fs::read_to_string(&key_path).unwrap()).unwrap();
        assert_eq!(on_disk.device_id, original.device_id());
        let _ = fs::remove_dir_all(&test_dir);
    }

    #[test]
    fn test_signature_verifies_against_encoded_public_key() {
        let identity = DeviceIdentity::from_signing_key(SigningKey::from_bytes(&[5u8; 32]));
        let sig = identity.sign(b"payload");
        assert!(crypto::verify_device_signature(
            &identity.public_key_encoded(),
            b"payload",
            &sig
        ));
        assert_eq!(sig, identity.sign(b"payload"));
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let test_dir = get_test_path();
        let key_path = test_dir.join("device.json");
        let cache = IdentityCache::new();
        let a = cache.load(&key_path).unwrap();
        let b = cache.load(&key_path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let _ = fs::remove_dir_all(&test_dir);
    }
}
