use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("entropy source failed: {0}")]
    Entropy(String),
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("stored credential data is corrupt: {0}")]
    Integrity(String),
}

/// Cost parameters for the Argon2id derivation. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Decode a stored salt. Malformed data is an integrity error, never a failed credential check.
    pub fn from_base64(encoded: &str) -> Result<Self, HashError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| HashError::Integrity(format!("salt is not valid base64: {err}")))?;
        let bytes: [u8; SALT_LEN] = bytes.try_into().map_err(|raw: Vec<u8>| {
            HashError::Integrity(format!(
                "salt has {} bytes, expected {SALT_LEN}",
                raw.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Salt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Salt(..)")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DerivedHash([u8; HASH_LEN]);

impl DerivedHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn matches(&self, other: &[u8]) -> bool {
        self.0.as_slice().ct_eq(other).into()
    }
}

impl std::fmt::Debug for DerivedHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedHash(..)")
    }
}

/// Derives salted hashes for passwords and mail-verification secrets.
///
/// Both secrets go through the same function and parameters; only the input differs.
#[derive(Clone)]
pub struct PasswordHasher {
    params: KdfParams,
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new(params: KdfParams) -> Result<Self, HashError> {
        let argon_params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(HASH_LEN),
        )
        .map_err(|err| HashError::Kdf(err.to_string()))?;

        Ok(Self {
            params,
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params),
        })
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    pub fn new_salt(&self) -> Result<Salt, HashError> {
        let mut bytes = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| HashError::Entropy(err.to_string()))?;
        Ok(Salt(bytes))
    }

    pub fn derive(&self, secret: &str, salt: &Salt) -> Result<DerivedHash, HashError> {
        let mut output = [0u8; HASH_LEN];
        self.argon2
            .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut output)
            .map_err(|err| HashError::Kdf(err.to_string()))?;
        Ok(DerivedHash(output))
    }

    pub fn register_secret(&self, secret: &str) -> Result<(Salt, DerivedHash), HashError> {
        let salt = self.new_salt()?;
        let hash = self.derive(secret, &salt)?;
        Ok((salt, hash))
    }

    /// Recompute the hash for `secret` and compare it with a stored base64 hash in constant time.
    pub fn verify(&self, secret: &str, salt: &Salt, stored: &str) -> Result<bool, HashError> {
        let expected = STANDARD.decode(stored).map_err(|err| {
            HashError::Integrity(format!("stored hash is not valid base64: {err}"))
        })?;
        let derived = self.derive(secret, salt)?;
        Ok(derived.matches(&expected))
    }

    /// Run [`Self::derive`] on the blocking pool. The derivation always runs to completion.
    pub async fn derive_blocking(
        self: Arc<Self>,
        secret: String,
        salt: Salt,
    ) -> Result<DerivedHash, HashError> {
        tokio::task::spawn_blocking(move || self.derive(&secret, &salt))
            .await
            .map_err(|err| HashError::Kdf(format!("derivation task failed: {err}")))?
    }

    pub async fn verify_blocking(
        self: Arc<Self>,
        secret: String,
        salt: Salt,
        stored: String,
    ) -> Result<bool, HashError> {
        tokio::task::spawn_blocking(move || self.verify(&secret, &salt, &stored))
            .await
            .map_err(|err| HashError::Kdf(format!("derivation task failed: {err}")))?
    }

    pub async fn register_blocking(
        self: Arc<Self>,
        secret: String,
    ) -> Result<(Salt, DerivedHash), HashError> {
        tokio::task::spawn_blocking(move || self.register_secret(&secret))
            .await
            .map_err(|err| HashError::Kdf(format!("derivation task failed: {err}")))?
    }
}
