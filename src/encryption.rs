//! Fernet-equivalent envelope encryption: AES-128-CBC with an HMAC-SHA256
//! authentication tag, built from RustCrypto primitives. State blobs carry a
//! `TPENC1:` magic prefix so legacy plaintext can still be read back.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::AppError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const STATE_MAGIC: &[u8] = b"TPENC1:";
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Holds the split Fernet-style key material: bytes `[0..16]` are the AES key,
/// `[16..32]` are the HMAC key, matching Fernet's own key layout.
#[derive(Clone)]
pub struct EncryptionKey {
    aes_key: [u8; 16],
    hmac_key: [u8; 16],
}

impl EncryptionKey {
    pub fn from_hex(hex_str: &str) -> Result<Self, AppError> {
        let bytes = hex::decode(hex_str)
            .map_err(|_| AppError::ValidationError("encryption key is not valid hex".into()))?;
        if bytes.len() != 32 {
            return Err(AppError::ValidationError(
                "encryption key must decode to 32 bytes".into(),
            ));
        }
        let mut aes_key = [0u8; 16];
        let mut hmac_key = [0u8; 16];
        aes_key.copy_from_slice(&bytes[0..16]);
        hmac_key.copy_from_slice(&bytes[16..32]);
        Ok(Self { aes_key, hmac_key })
    }
}

/// Holds the configured key, if any. Constructed once at startup from
/// `config::ENCRYPTION_KEY` and shared as an `Extension`.
#[derive(Clone)]
pub struct Envelope {
    key: Option<EncryptionKey>,
}

impl Envelope {
    pub fn from_config() -> Result<Self, AppError> {
        let key = match crate::config::ENCRYPTION_KEY.as_ref() {
            Some(hex_str) => Some(EncryptionKey::from_hex(hex_str)?),
            None => None,
        };
        Ok(Self { key })
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    fn seal(&self, key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext =
            Aes128CbcEnc::new(&key.aes_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = HmacSha256::new_from_slice(&key.hmac_key).expect("hmac accepts any key length");
        mac.update(&iv);
        mac.update(&ciphertext);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        out
    }

    fn unseal(&self, key: &EncryptionKey, token: &[u8]) -> Result<Vec<u8>, AppError> {
        if token.len() < IV_LEN + TAG_LEN {
            return Err(AppError::CorruptCiphertext);
        }
        let (body, tag) = token.split_at(token.len() - TAG_LEN);
        let (iv, ciphertext) = body.split_at(IV_LEN);

        let mut mac = HmacSha256::new_from_slice(&key.hmac_key).expect("hmac accepts any key length");
        mac.update(iv);
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| AppError::CorruptCiphertext)?;

        let iv_arr: [u8; IV_LEN] = iv.try_into().expect("split guarantees length");
        Aes128CbcDec::new(&key.aes_key.into(), &iv_arr.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| AppError::CorruptCiphertext)
    }

    /// Encrypt a small text value (e.g. a sensitive workspace variable).
    /// Fails with `encryption_not_configured`-shaped validation error when no
    /// key is set — sensitive variables require encryption, unlike state.
    pub fn encrypt_value(&self, plaintext: &str) -> Result<String, AppError> {
        let key = self.key.as_ref().ok_or_else(|| {
            AppError::ValidationError("encryption_not_configured".into())
        })?;
        let token = self.seal(key, plaintext.as_bytes());
        Ok(STANDARD.encode(token))
    }

    pub fn decrypt_value(&self, ciphertext: &str) -> Result<String, AppError> {
        let key = self.key.as_ref().ok_or(AppError::EncryptionKeyMissing)?;
        let token = STANDARD
            .decode(ciphertext)
            .map_err(|_| AppError::CorruptCiphertext)?;
        let plaintext = self.unseal(key, &token)?;
        String::from_utf8(plaintext).map_err(|_| AppError::CorruptCiphertext)
    }

    /// Encrypt a state blob. Returns plaintext unchanged when no key is
    /// configured, so development deployments can run without one.
    pub fn encrypt_state(&self, plaintext: &[u8]) -> Vec<u8> {
        match &self.key {
            None => plaintext.to_vec(),
            Some(key) => {
                let token = self.seal(key, plaintext);
                let mut out = Vec::with_capacity(STATE_MAGIC.len() + token.len());
                out.extend_from_slice(STATE_MAGIC);
                out.extend_from_slice(&token);
                out
            }
        }
    }

    /// Decrypt a state blob, passing legacy plaintext (no magic prefix)
    /// through untouched.
    pub fn decrypt_state(&self, data: &[u8]) -> Result<Vec<u8>, AppError> {
        let Some(token) = data.strip_prefix(STATE_MAGIC) else {
            return Ok(data.to_vec());
        };
        let key = self.key.as_ref().ok_or(AppError::EncryptionKeyMissing)?;
        self.unseal(key, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn value_round_trips() {
        let envelope = Envelope { key: Some(test_key()) };
        let ciphertext = envelope.encrypt_value("super-secret").unwrap();
        assert_eq!(envelope.decrypt_value(&ciphertext).unwrap(), "super-secret");
    }

    #[test]
    fn state_round_trips_through_magic_prefix() {
        let envelope = Envelope { key: Some(test_key()) };
        let sealed = envelope.encrypt_state(b"tfstate-bytes");
        assert!(sealed.starts_with(STATE_MAGIC));
        assert_eq!(envelope.decrypt_state(&sealed).unwrap(), b"tfstate-bytes");
    }

    #[test]
    fn legacy_plaintext_state_passes_through() {
        let envelope = Envelope { key: Some(test_key()) };
        let legacy = b"not encrypted".to_vec();
        assert_eq!(envelope.decrypt_state(&legacy).unwrap(), legacy);
    }

    #[test]
    fn state_without_key_is_stored_plaintext() {
        let envelope = Envelope { key: None };
        let sealed = envelope.encrypt_state(b"dev-state");
        assert_eq!(sealed, b"dev-state");
    }

    #[test]
    fn encrypted_state_without_key_fails_to_decrypt() {
        let with_key = Envelope { key: Some(test_key()) };
        let sealed = with_key.encrypt_state(b"secret-state");
        let without_key = Envelope { key: None };
        assert!(matches!(
            without_key.decrypt_state(&sealed),
            Err(AppError::EncryptionKeyMissing)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let envelope = Envelope { key: Some(test_key()) };
        let mut sealed = envelope.encrypt_state(b"secret-state");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(
            envelope.decrypt_state(&sealed),
            Err(AppError::CorruptCiphertext)
        ));
    }
}
