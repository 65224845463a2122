//! Stateless artifact transforms: serialize → compress → encrypt → checksum,
//! and the inverse.

pub mod encryption;
pub mod key_derivation;

pub use encryption::{ArtifactCipher, HEADER_LEN, IV_LEN, TAG_LEN};
pub use key_derivation::KdfParams;

use sha2::{Digest, Sha256};

use crate::error::BackupError;
use crate::models::payload::BackupPayload;

pub fn serialize_payload(payload: &BackupPayload) -> Result<Vec<u8>, BackupError> {
    serde_json::to_vec(payload)
        .map_err(|e| BackupError::Compression(format!("Failed to serialize payload: {}", e)))
}

pub fn deserialize_payload(bytes: &[u8]) -> Result<BackupPayload, BackupError> {
    serde_json::from_slice(bytes)
        .map_err(|e| BackupError::Integrity(format!("Malformed payload document: {}", e)))
}

pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, BackupError> {
    zstd::encode_all(data, level).map_err(|e| BackupError::Compression(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, BackupError> {
    zstd::decode_all(data).map_err(|e| BackupError::Compression(e.to_string()))
}

/// SHA-256 over the sealed artifact, lowercase hex.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A sealed artifact ready to persist.
#[derive(Debug)]
pub struct SealedArtifact {
    pub bytes: Vec<u8>,
    pub checksum: String,
    pub plain_len: usize,
}

pub fn seal_payload(
    payload: &BackupPayload,
    level: i32,
    cipher: &ArtifactCipher,
) -> Result<SealedArtifact, BackupError> {
    let serialized = serialize_payload(payload)?;
    let compressed = compress(&serialized, level)?;
    tracing::debug!(
        plain = serialized.len(),
        compressed = compressed.len(),
        level,
        "Compressed payload"
    );
    let bytes = cipher.seal(&compressed)?;
    let checksum = checksum(&bytes);
    Ok(SealedArtifact {
        bytes,
        checksum,
        plain_len: serialized.len(),
    })
}

/// Decrypt, decompress and deserialize. Authentication happens first, so a
/// tampered artifact never yields a payload.
pub fn open_payload(artifact: &[u8], cipher: &ArtifactCipher) -> Result<BackupPayload, BackupError> {
    let compressed = cipher.open(artifact)?;
    let serialized = decompress(&compressed)?;
    let payload = deserialize_payload(&serialized)?;
    payload.validate()?;
    Ok(payload)
}
