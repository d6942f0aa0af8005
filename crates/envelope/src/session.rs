use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// AES-GCM IV length used by every envelope field.
pub const IV_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session key must be 32 bytes")]
    KeyLength,
    #[error("field is not valid base64")]
    Base64,
    #[error("iv must be {IV_LEN} bytes")]
    IvLength,
    #[error("authentication failed")]
    Auth,
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

/// One encrypted field: base64 ciphertext (with GCM tag) and base64 IV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedField {
    pub ciphertext: String,
    pub iv: String,
}

/// Symmetric key shared by all fields of one envelope.
pub struct SessionKey {
    cipher: Aes256Gcm,
    raw: [u8; 32],
}

impl SessionKey {
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut raw = [0u8; 32];
        raw.copy_from_slice(key.as_slice());
        Self {
            cipher: Aes256Gcm::new(&key),
            raw,
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, SessionError> {
        let cipher = Aes256Gcm::new_from_slice(raw).map_err(|_| SessionError::KeyLength)?;
        let raw: [u8; 32] = raw.try_into().map_err(|_| SessionError::KeyLength)?;
        Ok(Self { cipher, raw })
    }

    pub fn raw(&self) -> &[u8; 32] {
        &self.raw
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedField, SessionError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SessionError::Auth)?;
        Ok(SealedField {
            ciphertext: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(nonce),
        })
    }

    pub fn open(&self, field: &SealedField) -> Result<String, SessionError> {
        let ciphertext = STANDARD
            .decode(field.ciphertext.trim())
            .map_err(|_| SessionError::Base64)?;
        let iv = STANDARD
            .decode(field.iv.trim())
            .map_err(|_| SessionError::Base64)?;
        if iv.len() != IV_LEN {
            return Err(SessionError::IvLength);
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| SessionError::Auth)?;
        String::from_utf8(plaintext).map_err(|_| SessionError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_what_it_sealed() {
        let key = SessionKey::generate();
        let sealed = key.seal("héllo ✓").expect("seal");
        assert_eq!(STANDARD.decode(&sealed.iv).expect("iv").len(), IV_LEN);
        assert_eq!(key.open(&sealed).expect("open"), "héllo ✓");
    }

    #[test]
    fn rebuilt_key_matches() {
        let key = SessionKey::generate();
        let sealed = key.seal("payload").expect("seal");
        let rebuilt = SessionKey::from_raw(key.raw()).expect("raw");
        assert_eq!(rebuilt.open(&sealed).expect("open"), "payload");
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_eq!(SessionKey::from_raw(&[0u8; 16]).err(), Some(SessionError::KeyLength));

        let key = SessionKey::generate();
        let mut sealed = key.seal("payload").expect("seal");
        sealed.iv = STANDARD.encode([0u8; 16]);
        assert_eq!(key.open(&sealed), Err(SessionError::IvLength));

        let mut sealed = key.seal("payload").expect("seal");
        let mut bytes = STANDARD.decode(&sealed.ciphertext).expect("b64");
        bytes[0] ^= 0xff;
        sealed.ciphertext = STANDARD.encode(bytes);
        assert_eq!(key.open(&sealed), Err(SessionError::Auth));

        let other = SessionKey::generate();
        let sealed = key.seal("payload").expect("seal");
        assert_eq!(other.open(&sealed), Err(SessionError::Auth));
    }
}
