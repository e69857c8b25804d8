//! Node identity and keystore

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeystoreError {
    #[error("key '{0}' not found in keystore")]
    KeyNotFound(String),

    #[error("failed to read key file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("signature verification failed")]
    BadSignature,
}

/// Signing capability backed by a secure key store
pub trait Keystore: Send + Sync {
    /// Sign `message` with the key named `account_name`.
    /// Returns the raw signature and the hex-encoded public key.
    fn sign(&self, account_name: &str, message: &[u8]) -> Result<(Vec<u8>, String), KeystoreError>;

    /// Raw public key bytes for `account_name`
    fn public_key(&self, account_name: &str) -> Result<Vec<u8>, KeystoreError>;
}

/// Identity the node submits under. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub address: String,
    pub key_name: String,
    pub fee_denom: String,
}

impl NodeIdentity {
    /// Resolve the identity for `key_name` from the keystore
    pub fn load(
        keystore: &dyn Keystore,
        key_name: &str,
        address_prefix: &str,
        fee_denom: &str,
    ) -> Result<Self, KeystoreError> {
        let public_key = keystore.public_key(key_name)?;
        Ok(Self {
            address: derive_address(address_prefix, &public_key),
            key_name: key_name.to_string(),
            fee_denom: fee_denom.to_string(),
        })
    }
}

/// Address = prefix + hex(sha256(pubkey)[..20])
pub fn derive_address(prefix: &str, public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("{}{}", prefix, hex::encode(&digest[..20]))
}

/// Verify an ed25519 signature against a hex-encoded public key
pub fn verify_signature(pubkey_hex: &str, message: &[u8], signature: &[u8]) -> Result<(), KeystoreError> {
    let raw = hex::decode(pubkey_hex).map_err(|e| KeystoreError::InvalidPublicKey(e.to_string()))?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| KeystoreError::InvalidPublicKey("expected 32 bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&raw).map_err(|e| KeystoreError::InvalidPublicKey(e.to_string()))?;
    let signature = Signature::from_slice(signature).map_err(|_| KeystoreError::BadSignature)?;
    key.verify(message, &signature).map_err(|_| KeystoreError::BadSignature)
}

/// In-process keystore holding ed25519 keys loaded from key files
#[derive(Default)]
pub struct LocalKeystore {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl LocalKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, key: SigningKey) {
        self.keys.write().insert(name.to_string(), key);
    }

    /// Load `<dir>/<name>.json` (JSON byte array) or `<dir>/<name>.key` (raw
    /// bytes). Both 32-byte secrets and 64-byte keypairs are accepted.
    pub fn load_key(&self, dir: &Path, name: &str) -> Result<(), KeystoreError> {
        let json_path = dir.join(format!("{}.json", name));
        let raw_path = dir.join(format!("{}.key", name));

        let secret = if json_path.exists() {
            let content = read_file(&json_path)?;
            let bytes: Vec<u8> = serde_json::from_slice(&content)
                .map_err(|e| KeystoreError::InvalidKey(format!("failed to parse key JSON: {}", e)))?;
            Zeroizing::new(bytes)
        } else if raw_path.exists() {
            read_file(&raw_path)?
        } else {
            return Err(KeystoreError::KeyNotFound(name.to_string()));
        };

        let key = signing_key_from_bytes(&secret)?;
        self.insert(name, key);
        Ok(())
    }

    fn with_key<T>(&self, name: &str, f: impl FnOnce(&SigningKey) -> T) -> Result<T, KeystoreError> {
        let keys = self.keys.read();
        let key = keys
            .get(name)
            .ok_or_else(|| KeystoreError::KeyNotFound(name.to_string()))?;
        Ok(f(key))
    }
}

impl Keystore for LocalKeystore {
    fn sign(&self, account_name: &str, message: &[u8]) -> Result<(Vec<u8>, String), KeystoreError> {
        self.with_key(account_name, |key| {
            let signature = key.sign(message);
            (
                signature.to_bytes().to_vec(),
                hex::encode(key.verifying_key().to_bytes()),
            )
        })
    }

    fn public_key(&self, account_name: &str) -> Result<Vec<u8>, KeystoreError> {
        self.with_key(account_name, |key| key.verifying_key().to_bytes().to_vec())
    }
}

fn read_file(path: &Path) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .map_err(|e| KeystoreError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn signing_key_from_bytes(bytes: &[u8]) -> Result<SigningKey, KeystoreError> {
    if bytes.iter().all(|&b| b == 0) {
        return Err(KeystoreError::InvalidKey("all-zero key rejected".to_string()));
    }
    // 64-byte keypairs carry the secret in the first half
    let secret: &[u8] = match bytes.len() {
        32 => bytes,
        64 => &bytes[..32],
        n => {
            return Err(KeystoreError::InvalidKey(format!(
                "expected 32 or 64 bytes, got {}",
                n
            )))
        }
    };
    let mut seed = Zeroizing::new([0u8; 32]);
    seed.copy_from_slice(secret);
    Ok(SigningKey::from_bytes(&seed))
}
