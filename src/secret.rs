//! Secret codec for stored database passwords.
//!
//! Two independent representations are kept per credential:
//!
//! - a one-way Argon2id hash (`hash` / `verify`), stored as `password_hash`;
//! - an AES-256-GCM sealed copy (`seal` / `open`) under a server-managed key,
//!   opened only in memory when a downstream pool is built.
//!
//! Sealed blob layout, base64 encoded: `[0x01 || nonce(12) || ciphertext+tag]`.

use crate::error::{BrokerError, BrokerResult};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const BLOB_VERSION: u8 = 0x01;

/// Symmetric cipher for password-at-rest.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> BrokerResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| BrokerError::internal("secret key is not valid base64"))?,
        );
        let key: &[u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            BrokerError::internal(format!(
                "secret key must decode to {} bytes (got {})",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Encrypt a password into a base64 blob.
    pub fn seal(&self, plaintext: &str) -> BrokerResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| BrokerError::internal("failed to seal secret"))?;

        let mut blob = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> BrokerResult<Zeroizing<String>> {
        let data = BASE64
            .decode(sealed)
            .map_err(|_| BrokerError::internal("sealed secret is not valid base64"))?;
        if data.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(BrokerError::internal("sealed secret is too short"));
        }
        if data[0] != BLOB_VERSION {
            return Err(BrokerError::internal(format!(
                "unsupported sealed secret version: {}",
                data[0]
            )));
        }

        let nonce = Nonce::from_slice(&data[1..1 + NONCE_SIZE]);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(nonce, &data[1 + NONCE_SIZE..])
                .map_err(|_| BrokerError::internal("failed to open sealed secret (wrong key?)"))?,
        );
        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| BrokerError::internal("sealed secret is not UTF-8"))?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

/// Hashing plus sealing, shared by the credential store.
#[derive(Clone)]
pub struct SecretCodec {
    hasher: Argon2<'static>,
    cipher: SecretCipher,
}

impl SecretCodec {
    /// Codec with the default Argon2id parameters.
    pub fn new(cipher: SecretCipher) -> Self {
        Self {
            hasher: Argon2::default(),
            cipher,
        }
    }

    /// Codec with explicit Argon2id cost parameters (memory KiB, iterations, lanes).
    pub fn with_hash_params(
        cipher: SecretCipher,
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    ) -> BrokerResult<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| BrokerError::internal(format!("argon2 params: {e}")))?;
        Ok(Self {
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            cipher,
        })
    }

    /// One-way salted hash in PHC string format.
    pub fn hash(&self, plaintext: &str) -> BrokerResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| BrokerError::internal(format!("password hashing failed: {e}")))
    }

    /// Check a plaintext against a PHC hash. Malformed hashes never verify.
    pub fn verify(&self, plaintext: &str, secret_hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(secret_hash) else {
            return false;
        };
        self.hasher
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }

    pub fn seal(&self, plaintext: &str) -> BrokerResult<String> {
        self.cipher.seal(plaintext)
    }

    pub fn open(&self, sealed: &str) -> BrokerResult<Zeroizing<String>> {
        self.cipher.open(sealed)
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}
