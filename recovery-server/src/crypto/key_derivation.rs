//! Key derivation using Argon2id
//!
//! Every artifact gets its own key: the backup secret is stretched with the
//! artifact's random IV as salt, so no two artifacts share a key.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::BackupError;

pub const KEY_LEN: usize = 32;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Time cost (iterations)
    pub iterations: u32,
    /// Parallelism degree
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19456, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A derived AES-256 key, wiped on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_LEN]>;

pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<DerivedKey, BackupError> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| BackupError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(secret, salt, &mut key[..])
        .map_err(|e| BackupError::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHEAP: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn test_same_inputs_same_key() {
        let salt = [7u8; 16];
        let k1 = derive_key(b"secret", &salt, &CHEAP).unwrap();
        let k2 = derive_key(b"secret", &salt, &CHEAP).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn test_different_salt_different_key() {
        let k1 = derive_key(b"secret", &[1u8; 16], &CHEAP).unwrap();
        let k2 = derive_key(b"secret", &[2u8; 16], &CHEAP).unwrap();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let bad = KdfParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        assert!(matches!(
            derive_key(b"secret", &[0u8; 16], &bad),
            Err(BackupError::Encryption(_))
        ));
    }
}
