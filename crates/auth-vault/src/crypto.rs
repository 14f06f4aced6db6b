//! AES-256-GCM token encryption and SHA-256 fingerprinting (C1).

use aes_gcm::AesGcm;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aead::consts::U16;
use aes_gcm::aes::Aes256;
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

/// IV size in bytes, per §4.1.
pub const IV_SIZE: usize = 16;
/// Symmetric key size in bytes.
pub const KEY_SIZE: usize = 32;
/// GCM auth tag size in bytes.
const TAG_SIZE: usize = 16;

/// AES-256-GCM with a 16-byte nonce. `aes_gcm::Aes256Gcm` is a 12-byte-nonce
/// convenience alias and does not match §4.1's 16-byte IV, so the cipher is
/// instantiated from the generic `AesGcm` directly.
type Cipher = AesGcm<Aes256, U16>;

/// Process-wide symmetric key used for all vault ciphertext.
///
/// Constructed once at boot from `AUTH_MANAGER_TOKEN_VAULT_ENCRYPTION_KEY`;
/// absence or wrong length is a fatal configuration error, not a runtime
/// one, so parsing happens in `config`, not here.
#[derive(Clone)]
pub struct VaultKey(pub(crate) [u8; KEY_SIZE]);

impl VaultKey {
    /// Parses a 64-hex-char key. No base64 fallback: this is a narrower
    /// contract than a generic secrets-at-rest key loader.
    pub fn from_hex(s: &str) -> Result<Self, String> {
        if s.len() != KEY_SIZE * 2 {
            return Err(format!(
                "encryption key must be {} hex chars, got {}",
                KEY_SIZE * 2,
                s.len()
            ));
        }
        let bytes = hex::decode(s).map_err(|e| format!("invalid hex in encryption key: {e}"))?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }
}

/// A freshly generated 16-byte IV, CSPRNG-backed.
pub fn generate_iv() -> [u8; IV_SIZE] {
    use rand::RngCore;
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypts `plaintext` under `key` with the given 16-byte IV, returning
/// hex(ciphertext ‖ tag).
pub fn encrypt(key: &VaultKey, iv: &[u8; IV_SIZE], plaintext: &str) -> VaultResult<String> {
    let cipher = Cipher::new_from_slice(&key.0).map_err(|_| VaultError::EncryptionFailed)?;
    let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| VaultError::EncryptionFailed)?;
    Ok(hex::encode(ciphertext))
}

/// Decrypts a hex(ciphertext ‖ tag) blob under `key` and `iv`. Any mismatch
/// — wrong key, wrong IV, or a tampered byte anywhere in the blob — maps to
/// `decryption_failed`, which doubles as a tamper signal per §4.1.
pub fn decrypt(key: &VaultKey, iv: &[u8; IV_SIZE], blob_hex: &str) -> VaultResult<String> {
    let blob = hex::decode(blob_hex).map_err(|_| VaultError::DecryptionFailed)?;
    if blob.len() < TAG_SIZE {
        return Err(VaultError::DecryptionFailed);
    }
    let cipher = Cipher::new_from_slice(&key.0).map_err(|_| VaultError::DecryptionFailed)?;
    let nonce = aes_gcm::aead::generic_array::GenericArray::from_slice(iv);
    let plaintext = cipher
        .decrypt(nonce, blob.as_slice())
        .map_err(|_| VaultError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
}

/// SHA-256 hex digest of `plaintext`, used only for equality checks across
/// entries. Never sent off-box.
pub fn hash(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Decrypts the ciphertext carried by a vault entry. Shared by every call
/// site that needs the plaintext refresh/offline token back out of
/// storage, so the "missing column means decryption_failed" mapping lives
/// in exactly one place.
pub fn decrypt_entry(key: &VaultKey, entry: &crate::types::VaultEntry) -> VaultResult<String> {
    let ciphertext = entry.encrypted_token.as_deref().ok_or(VaultError::DecryptionFailed)?;
    let iv_hex = entry.iv.as_deref().ok_or(VaultError::DecryptionFailed)?;
    let iv_bytes = hex::decode(iv_hex).map_err(|_| VaultError::DecryptionFailed)?;
    let iv: [u8; IV_SIZE] = iv_bytes.try_into().map_err(|_| VaultError::DecryptionFailed)?;
    decrypt(key, &iv, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> VaultKey {
        VaultKey::from_hex(&"ab".repeat(KEY_SIZE)).unwrap()
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(VaultKey::from_hex("abcd").is_err());
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "zz".repeat(KEY_SIZE);
        assert!(VaultKey::from_hex(&bad).is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = test_key();
        let iv = generate_iv();
        let ciphertext = encrypt(&key, &iv, "rt-1").unwrap();
        let plaintext = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, "rt-1");
    }

    #[test]
    fn tampering_ciphertext_fails_decryption() {
        let key = test_key();
        let iv = generate_iv();
        let ciphertext = encrypt(&key, &iv, "rt-1").unwrap();
        let mut bytes = hex::decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = hex::encode(bytes);
        assert!(decrypt(&key, &iv, &tampered).is_err());
    }

    #[test]
    fn wrong_iv_fails_decryption() {
        let key = test_key();
        let iv = generate_iv();
        let ciphertext = encrypt(&key, &iv, "rt-1").unwrap();
        let other_iv = generate_iv();
        assert!(decrypt(&key, &other_iv, &ciphertext).is_err());
    }

    #[test]
    fn successive_ivs_differ() {
        let a = generate_iv();
        let b = generate_iv();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash("rt-1"), hash("rt-1"));
        assert_ne!(hash("rt-1"), hash("rt-2"));
    }
}
