//! AES-256-GCM artifact sealing
//!
//! On-disk layout is `[IV: 16][TAG: 16][CIPHERTEXT]`. The GCM nonce is the
//! full 16-byte IV, and the same IV salts the key derivation.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{AeadInPlace, KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use zeroize::Zeroizing;

use super::key_derivation::{derive_key, KdfParams};
use crate::error::BackupError;

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = IV_LEN + TAG_LEN;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub struct ArtifactCipher {
    secret: Zeroizing<Vec<u8>>,
    kdf: KdfParams,
}

impl ArtifactCipher {
    pub fn new(secret: &str, kdf: KdfParams) -> Self {
        Self {
            secret: Zeroizing::new(secret.as_bytes().to_vec()),
            kdf,
        }
    }

    fn cipher_for(&self, iv: &[u8]) -> Result<Aes256Gcm16, BackupError> {
        let key = derive_key(&self.secret, iv, &self.kdf)?;
        Aes256Gcm16::new_from_slice(&key[..])
            .map_err(|e| BackupError::Encryption(format!("Failed to create cipher: {}", e)))
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, BackupError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let cipher = self.cipher_for(&iv)?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| BackupError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut artifact = Vec::with_capacity(HEADER_LEN + buffer.len());
        artifact.extend_from_slice(&iv);
        artifact.extend_from_slice(&tag);
        artifact.extend_from_slice(&buffer);
        Ok(artifact)
    }

    /// Authenticate and decrypt an artifact. Any modified byte fails here.
    pub fn open(&self, artifact: &[u8]) -> Result<Vec<u8>, BackupError> {
        if artifact.len() < HEADER_LEN {
            return Err(BackupError::Decryption(format!(
                "artifact is {} bytes, shorter than the {}-byte header",
                artifact.len(),
                HEADER_LEN
            )));
        }
        let (iv, rest) = artifact.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let cipher = self.cipher_for(iv)?;
        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| {
                BackupError::Decryption(
                    "authentication failed: wrong key or corrupted artifact".to_string(),
                )
            })?;
        Ok(buffer)
    }
}
