//! Processed chunk file format
//!
//! ```text
//! nonce (12) || ciphertext+tag || "\n--HASH--\n" || digest [|| "\n--NEXT_KEY--\n" || base64(next key)]
//! ```
//!
//! The key link is appended by the finalizer. Chunk `i` links to the key of
//! chunk `i + 1`; the last chunk links back to the key of chunk 0.
//!
//! Ciphertext may contain separator bytes, so parsing always searches from
//! the end of the file, where digest and key are plain ASCII.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::cipher::ChunkCipher;
use super::ingest::compute_digest;
use super::types::{ChunkKey, UploadError, HASH_SEPARATOR, KEY_LEN, KEY_SEPARATOR, NONCE_LEN, TAG_LEN};

/// Build the sealed body of a processed chunk, before any key link
pub fn encode_sealed(nonce: &[u8; NONCE_LEN], ciphertext: &[u8], digest: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + HASH_SEPARATOR.len() + digest.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(HASH_SEPARATOR);
    out.extend_from_slice(digest.as_bytes());
    out
}

/// Bytes appended by the finalizer to link to the next key
pub fn chain_link(next_key: &ChunkKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_SEPARATOR.len() + 44);
    out.extend_from_slice(KEY_SEPARATOR);
    out.extend_from_slice(encode_key(next_key).as_bytes());
    out
}

pub fn encode_key(key: &ChunkKey) -> String {
    STANDARD.encode(key)
}

pub fn decode_key(encoded: &str) -> Result<ChunkKey, UploadError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| UploadError::Crypto(format!("invalid key encoding: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| UploadError::Crypto(format!("key must be {} bytes, got {}", KEY_LEN, b.len())))
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn malformed(reason: &str) -> UploadError {
    UploadError::Crypto(format!("malformed processed chunk: {}", reason))
}

// ============================================================================
// Parsing
// ============================================================================

/// A processed chunk split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedChunk {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub digest: String,

    /// Next key in the chain, present once finalized
    pub next_key: Option<ChunkKey>,
}

impl ProcessedChunk {
    pub fn parse(bytes: &[u8]) -> Result<Self, UploadError> {
        let (body, next_key) = match rfind(bytes, KEY_SEPARATOR) {
            Some(pos) => {
                let encoded = std::str::from_utf8(&bytes[pos + KEY_SEPARATOR.len()..])
                    .map_err(|_| malformed("key link is not ASCII"))?;
                (&bytes[..pos], Some(decode_key(encoded)?))
            }
            None => (bytes, None),
        };

        let hash_pos = rfind(body, HASH_SEPARATOR).ok_or_else(|| malformed("missing digest"))?;
        let digest = std::str::from_utf8(&body[hash_pos + HASH_SEPARATOR.len()..])
            .map_err(|_| malformed("digest is not ASCII"))?
            .to_string();

        let sealed = &body[..hash_pos];
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(malformed("truncated ciphertext"));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);

        Ok(Self {
            nonce,
            ciphertext: sealed[NONCE_LEN..].to_vec(),
            digest,
            next_key,
        })
    }

    /// Decrypt and check the plaintext against the recorded digest
    pub fn open(&self, cipher: ChunkCipher, key: &ChunkKey) -> Result<Vec<u8>, UploadError> {
        let plaintext = cipher.decrypt(key, &self.nonce, &self.ciphertext)?;
        if compute_digest(&plaintext) != self.digest {
            return Err(UploadError::Crypto("digest mismatch".to_string()));
        }
        Ok(plaintext)
    }
}

/// Walk a finalized key chain and reassemble the uploaded file.
///
/// `files` must be in chunk order. Fails if any chunk does not decrypt, any
/// digest mismatches, a link is missing, or the last chunk does not close
/// the ring back to `initial_key`.
pub async fn decrypt_chain(
    cipher: ChunkCipher,
    files: &[PathBuf],
    initial_key: &ChunkKey,
) -> Result<Vec<u8>, UploadError> {
    let mut output = Vec::new();
    let mut key = *initial_key;

    for (index, path) in files.iter().enumerate() {
        let bytes = tokio::fs::read(path).await?;
        let chunk = ProcessedChunk::parse(&bytes)?;

        output.extend_from_slice(&chunk.open(cipher, &key)?);

        key = chunk
            .next_key
            .ok_or_else(|| malformed(&format!("chunk {} has no key link", index)))?;
    }

    if !files.is_empty() && key != *initial_key {
        return Err(UploadError::Crypto("key chain does not close".to_string()));
    }

    Ok(output)
}
