//! Crypto session: symmetric key + IV shared through the handshake, and the
//! encrypt/decrypt of JSON payloads carried in wire messages.
//!
//! The initiator generates the key and IV once per handshake and ships them in
//! exported form; the acceptor only ever imports. A session is either complete
//! (algorithm, IV and key all present) or absent, never partial.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::codec::{self, CodecError};

/// Algorithm identifier used in exported keys (JOSE name for ChaCha20-Poly1305).
pub const ALGORITHM: &str = "C20P";
/// Key type of exported keys: raw symmetric octets.
pub const KEY_TYPE: &str = "oct";
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

/// Transportable form of the session key. JWK-shaped so it crosses the
/// transport as plain serializable data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    pub kty: String,
    pub alg: String,
    /// Key bytes, base64url without padding.
    pub k: String,
}

/// Established session. Cloning copies the key material; keep clones short-lived.
#[derive(Clone)]
pub struct CryptoSession {
    algorithm: &'static str,
    iv: [u8; IV_LEN],
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl CryptoSession {
    /// Fresh random key and IV (initiator side).
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self {
            algorithm: ALGORITHM,
            iv,
            key,
        }
    }

    /// Rebuild a session from the peer's exported key and IV (acceptor side).
    pub fn import(exported: &ExportedKey, iv: &[u8]) -> Result<Self, CryptoError> {
        if exported.kty != KEY_TYPE {
            return Err(CryptoError::KeyType(exported.kty.clone()));
        }
        if exported.alg != ALGORITHM {
            return Err(CryptoError::Algorithm(exported.alg.clone()));
        }
        let key: [u8; KEY_LEN] = codec::decode_base64url(&exported.k)?
            .try_into()
            .map_err(|_| CryptoError::KeyLength)?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::IvLength)?;
        Ok(Self {
            algorithm: ALGORITHM,
            iv,
            key,
        })
    }

    pub fn export_key(&self) -> ExportedKey {
        ExportedKey {
            kty: KEY_TYPE.to_string(),
            alg: self.algorithm.to_string(),
            k: codec::encode_base64url(&self.key),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        self.algorithm
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// First 8 bytes of SHA-256 over the key, hex. Equal on both sides of one session.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"postbridge-session-v1");
        hasher.update(self.key);
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Serialize `data`, seal it, and return the base64 ciphertext string.
    pub fn encrypt(&self, data: &Value) -> Result<String, CryptoError> {
        let plaintext = codec::to_plaintext(data)?;
        let sealed = self.seal(&plaintext)?;
        Ok(codec::encode_base64(&sealed))
    }

    /// Inverse of [`encrypt`](Self::encrypt). An empty plaintext yields `Value::Null`.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Value, CryptoError> {
        let sealed = codec::decode_base64(ciphertext)?;
        let plaintext = self.open(&sealed)?;
        Ok(codec::from_plaintext(&plaintext)?)
    }

    /// Output layout: 12-byte salt || AEAD ciphertext. Nonce = IV XOR salt, so
    /// the fixed session IV never becomes a reused nonce.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut salt = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = self.nonce(&salt);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub(crate) fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < IV_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (salt, ciphertext) = sealed.split_at(IV_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = self.nonce(salt);
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    fn nonce(&self, salt: &[u8]) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (n, s) in nonce.iter_mut().zip(salt) {
            *n ^= s;
        }
        nonce
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported key type {0:?}")]
    KeyType(String),
    #[error("unsupported algorithm {0:?}")]
    Algorithm(String),
    #[error("key must be 32 bytes")]
    KeyLength,
    #[error("iv must be 12 bytes")]
    IvLength,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error(transparent)]
    Codec(#[from] CodecError),
}
