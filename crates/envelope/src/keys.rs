use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("server keys not initialized")]
    NotReady,
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ciphertext is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("ECIES decryption failed")]
    Decrypt,
    #[error("plaintext is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Where the server's secp256k1 secret comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    Hex(String),
    File(PathBuf),
    /// Fixed, publicly known development key
    Development,
}

/// Secret used when no key is configured outside strict mode. Anyone can
/// decrypt envelopes sealed for it.
pub const DEV_SECRET_HEX: &str = "b5b1870857d1272961d0448192c906857181c7b8763568910826922d57ba827c";

struct ServerKey {
    secret: [u8; 32],
    public_hex: String,
}

/// Holds the server key once it is loaded. Until then every operation
/// reports `NotReady`.
#[derive(Default)]
pub struct KeyStore {
    key: OnceLock<ServerKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the key from configuration. A missing key falls back to the
    /// development key unless `strict` is set, in which case the store stays
    /// not ready.
    pub fn from_settings(hex_key: Option<&str>, key_file: Option<&Path>, strict: bool) -> Self {
        let store = Self::new();
        let source = match (hex_key, key_file) {
            (Some(hex_key), _) => Some(KeySource::Hex(hex_key.to_string())),
            (None, Some(path)) => Some(KeySource::File(path.to_path_buf())),
            (None, None) if strict => None,
            (None, None) => Some(KeySource::Development),
        };

        match source {
            Some(source) => {
                if let Err(err) = store.load(source) {
                    tracing::error!(error = %err, "Failed to load server key");
                }
            }
            None => {
                tracing::error!("No server key configured and STRICT_KEY_DERIVATION is set");
            }
        }
        store
    }

    pub fn load(&self, source: KeySource) -> Result<(), KeyError> {
        let secret = match source {
            KeySource::Hex(value) => parse_secret_hex(&value)?,
            KeySource::File(path) => {
                let contents = std::fs::read_to_string(&path).map_err(|source| KeyError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_secret_hex(&contents)?
            }
            KeySource::Development => {
                tracing::warn!("No server key configured, using the development key");
                parse_secret_hex(DEV_SECRET_HEX)?
            }
        };
        self.install(secret)
    }

    fn install(&self, secret: [u8; 32]) -> Result<(), KeyError> {
        let secret_key = ecies::SecretKey::parse_slice(&secret)
            .map_err(|_| KeyError::InvalidKey("not a valid secp256k1 scalar".to_string()))?;
        let public = ecies::PublicKey::from_secret_key(&secret_key);
        let key = ServerKey {
            secret,
            public_hex: hex::encode(public.serialize_compressed()),
        };
        let public_hex = key.public_hex.clone();
        if self.key.set(key).is_err() {
            tracing::warn!("Server key already loaded, keeping the first one");
            return Ok(());
        }
        tracing::info!(public_key = %public_hex, "Server key ready");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.key.get().is_some()
    }

    /// Compressed SEC1 public key, hex encoded.
    pub fn public_key_hex(&self) -> Option<&str> {
        self.key.get().map(|key| key.public_hex.as_str())
    }

    /// ECIES-decrypt base64 ciphertext into raw bytes.
    pub fn decrypt_raw(&self, ciphertext_b64: &str) -> Result<Vec<u8>, KeyError> {
        let key = self.key.get().ok_or(KeyError::NotReady)?;
        let ciphertext = STANDARD.decode(ciphertext_b64.trim())?;
        ecies::decrypt(&key.secret, &ciphertext).map_err(|_| KeyError::Decrypt)
    }

    /// ECIES-decrypt base64 ciphertext into a UTF-8 string.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String, KeyError> {
        let bytes = self.decrypt_raw(ciphertext_b64)?;
        Ok(String::from_utf8(bytes)?)
    }
}

fn parse_secret_hex(value: &str) -> Result<[u8; 32], KeyError> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|err| KeyError::InvalidKey(err.to_string()))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| KeyError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f2a55949038a9610f50fb23b5883af3b4ecb3c3bb792cbcefbd1542c692be63";

    fn encrypt_for(store: &KeyStore, plaintext: &[u8]) -> String {
        let public = hex::decode(store.public_key_hex().expect("ready")).expect("hex");
        STANDARD.encode(ecies::encrypt(&public, plaintext).expect("encrypt"))
    }

    #[test]
    fn empty_store_is_not_ready() {
        let store = KeyStore::new();
        assert!(!store.is_ready());
        assert!(store.public_key_hex().is_none());
        assert!(matches!(store.decrypt("AAAA"), Err(KeyError::NotReady)));
    }

    #[test]
    fn strict_without_key_stays_not_ready() {
        let store = KeyStore::from_settings(None, None, true);
        assert!(!store.is_ready());
    }

    #[test]
    fn dev_without_key_uses_the_fixed_key() {
        let store = KeyStore::from_settings(None, None, false);
        let again = KeyStore::from_settings(None, None, false);
        let explicit = KeyStore::from_settings(Some(DEV_SECRET_HEX), None, true);
        assert!(store.is_ready());
        assert_eq!(store.public_key_hex().expect("public").len(), 66);
        assert_eq!(store.public_key_hex(), again.public_key_hex());
        assert_eq!(store.public_key_hex(), explicit.public_key_hex());

        let ciphertext = encrypt_for(&store, b"sealed before restart");
        assert_eq!(again.decrypt(&ciphertext).expect("decrypt"), "sealed before restart");
    }

    #[test]
    fn hex_key_is_deterministic() {
        let a = KeyStore::from_settings(Some(SECRET), None, true);
        let b = KeyStore::from_settings(Some(&format!("0x{}\n", SECRET)), None, true);
        assert!(a.is_ready());
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn rejects_malformed_keys() {
        let store = KeyStore::new();
        assert!(matches!(
            store.load(KeySource::Hex("abcd".to_string())),
            Err(KeyError::InvalidKey(_))
        ));
        assert!(matches!(
            store.load(KeySource::Hex("zz".repeat(32))),
            Err(KeyError::InvalidKey(_))
        ));
        assert!(matches!(
            store.load(KeySource::Hex("00".repeat(32))),
            Err(KeyError::InvalidKey(_))
        ));
        assert!(!store.is_ready());
    }

    #[test]
    fn key_file_is_read() {
        let path = std::env::temp_dir().join(format!("box_key_{}.hex", std::process::id()));
        std::fs::write(&path, SECRET).expect("write key");
        let store = KeyStore::from_settings(None, Some(&path), true);
        let _ = std::fs::remove_file(&path);
        assert!(store.is_ready());
    }

    #[test]
    fn decrypts_what_was_encrypted_for_it() {
        let store = KeyStore::from_settings(Some(SECRET), None, true);
        let ciphertext = encrypt_for(&store, "function main() { return 1; }".as_bytes());
        assert_eq!(
            store.decrypt(&ciphertext).expect("decrypt"),
            "function main() { return 1; }"
        );
    }

    #[test]
    fn foreign_ciphertext_fails() {
        let ours = KeyStore::from_settings(Some(SECRET), None, true);
        let theirs = KeyStore::from_settings(None, None, false);
        let ciphertext = encrypt_for(&theirs, b"secret");
        assert!(matches!(ours.decrypt(&ciphertext), Err(KeyError::Decrypt)));
        assert!(matches!(ours.decrypt("not base64!"), Err(KeyError::Base64(_))));
    }
}
