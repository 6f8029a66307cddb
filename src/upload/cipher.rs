//! Per-chunk AEAD ciphers
//!
//! Both ciphers take a 256-bit key and a 96-bit nonce and append a 128-bit
//! tag. The processed-chunk format carries no cipher marker; the reader
//! must be configured with the same [`ChunkCipher`] as the writer.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::types::{ChunkKey, UploadError, KEY_LEN, NONCE_LEN};

/// AEAD used to seal chunk contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkCipher {
    #[default]
    AesGcm,
    #[serde(rename = "chacha20")]
    ChaCha20,
}

impl ChunkCipher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AesGcm => "aes-gcm",
            Self::ChaCha20 => "chacha20",
        }
    }

    /// Fresh random key from the OS CSPRNG
    pub fn generate_key() -> ChunkKey {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Fresh random nonce from the OS CSPRNG
    pub fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Seal `plaintext`, returning ciphertext with the tag appended
    pub fn encrypt(
        &self,
        key: &ChunkKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, UploadError> {
        let result = match self {
            Self::AesGcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| UploadError::Crypto(e.to_string()))?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext),
            Self::ChaCha20 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| UploadError::Crypto(e.to_string()))?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext),
        };
        result.map_err(|_| UploadError::Crypto(format!("{} encryption failed", self)))
    }

    /// Open ciphertext produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(
        &self,
        key: &ChunkKey,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, UploadError> {
        let result = match self {
            Self::AesGcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| UploadError::Crypto(e.to_string()))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            Self::ChaCha20 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| UploadError::Crypto(e.to_string()))?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext),
        };
        result.map_err(|_| UploadError::Crypto(format!("{} authentication failed", self)))
    }
}

impl fmt::Display for ChunkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkCipher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-gcm" | "aes" | "aes-256-gcm" => Ok(Self::AesGcm),
            "chacha20" | "chacha20-poly1305" => Ok(Self::ChaCha20),
            other => Err(format!("unknown cipher: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::types::TAG_LEN;

    #[test]
    fn test_seal_and_open_both_ciphers() {
        for cipher in [ChunkCipher::AesGcm, ChunkCipher::ChaCha20] {
            let key = ChunkCipher::generate_key();
            let nonce = ChunkCipher::generate_nonce();

            let sealed = cipher.encrypt(&key, &nonce, b"chunk body").unwrap();
            assert_eq!(sealed.len(), b"chunk body".len() + TAG_LEN);
            assert_eq!(cipher.decrypt(&key, &nonce, &sealed).unwrap(), b"chunk body");
        }
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let cipher = ChunkCipher::AesGcm;
        let nonce = ChunkCipher::generate_nonce();
        let sealed = cipher
            .encrypt(&ChunkCipher::generate_key(), &nonce, b"secret")
            .unwrap();

        let err = cipher
            .decrypt(&ChunkCipher::generate_key(), &nonce, &sealed)
            .unwrap_err();
        assert!(matches!(err, UploadError::Crypto(_)));
    }

    #[test]
    fn test_parse_cipher_names() {
        assert_eq!("aes-gcm".parse::<ChunkCipher>().unwrap(), ChunkCipher::AesGcm);
        assert_eq!("ChaCha20".parse::<ChunkCipher>().unwrap(), ChunkCipher::ChaCha20);
        assert!("rot13".parse::<ChunkCipher>().is_err());
    }

    #[test]
    fn test_keys_are_unique() {
        assert_ne!(ChunkCipher::generate_key(), ChunkCipher::generate_key());
    }
}
