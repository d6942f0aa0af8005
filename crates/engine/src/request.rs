use serde::Deserialize;
use serde_json::Value;

/// Body of `POST /execute`.
///
/// Three ways to ship code: plaintext `code`, a legacy ECIES-encrypted
/// `encryptedCode`, or an envelope inside `encryptedParams` that may carry
/// code alongside the params it wraps.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub encrypted_code: Option<String>,
    /// Envelope JSON, either as a string or inline object
    #[serde(default)]
    pub encrypted_params: Option<Value>,
    #[serde(default)]
    pub public_params: Option<Value>,
}

impl ExecuteRequest {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Plaintext code, if any. An empty string counts as absent.
    pub fn plain_code(&self) -> Option<&str> {
        self.code.as_deref().filter(|code| !code.is_empty())
    }

    pub fn legacy_ciphertext(&self) -> Option<&str> {
        self.encrypted_code.as_deref().filter(|code| !code.is_empty())
    }

    /// Envelope text for unwrapping. Inline objects are re-serialized.
    pub fn envelope_text(&self) -> Option<String> {
        match self.encrypted_params.as_ref()? {
            Value::Null => None,
            Value::String(text) if text.is_empty() => None,
            Value::String(text) => Some(text.clone()),
            other => serde_json::to_string(other).ok(),
        }
    }
}
