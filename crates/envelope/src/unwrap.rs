use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use runtime_core::Params;
use serde_json::{Map, Value};

use crate::keys::{KeyError, KeyStore};
use crate::session::{SealedField, SessionError, SessionKey};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Failed to unwrap session key: {0}")]
    Capsule(#[source] KeyError),
    #[error("Invalid session key: {0}")]
    SessionKey(#[source] SessionError),
    #[error("Failed to decrypt param {name}")]
    Param {
        name: String,
        #[source]
        source: SessionError,
    },
    #[error("Failed to decrypt code")]
    Code(#[source] SessionError),
    #[error("Failed to seal envelope: {0}")]
    Seal(String),
}

/// Plaintext recovered from an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    pub params: Params,
    pub code: Option<String>,
}

/// Unwrap an envelope.
///
/// `Ok(None)` means `raw` is not an envelope at all (not JSON, no
/// `capsules.box`, or nothing to decrypt); callers fall back to other modes.
/// Once the shape matches, every failure is an error and no partial result
/// is returned.
pub fn try_unwrap_envelope(raw: &str, keys: &KeyStore) -> Result<Option<Unwrapped>, EnvelopeError> {
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(raw) else {
        return Ok(None);
    };
    let Some(capsule) = root
        .get("capsules")
        .and_then(|capsules| capsules.get("box"))
        .and_then(Value::as_str)
    else {
        return Ok(None);
    };
    let data = root.get("data").and_then(Value::as_object);
    let code = root.get("code").filter(|code| !code.is_null());
    if data.is_none() && code.is_none() {
        return Ok(None);
    }

    let raw_key = keys.decrypt_raw(capsule).map_err(EnvelopeError::Capsule)?;
    let session = SessionKey::from_raw(&raw_key).map_err(EnvelopeError::SessionKey)?;

    let mut params = Params::new();
    for (name, entry) in data.into_iter().flatten() {
        // Entries without both parts are not encrypted fields.
        let Some(field) = sealed_field(entry) else {
            continue;
        };
        let plaintext = session
            .open(&field)
            .map_err(|source| EnvelopeError::Param {
                name: name.clone(),
                source,
            })?;
        params.insert(name.clone(), Value::String(plaintext));
    }

    let code = match code {
        Some(entry) => {
            let field = sealed_field(entry).ok_or(EnvelopeError::Code(SessionError::Base64))?;
            Some(session.open(&field).map_err(EnvelopeError::Code)?)
        }
        None => None,
    };

    Ok(Some(Unwrapped { params, code }))
}

fn sealed_field(entry: &Value) -> Option<SealedField> {
    let ciphertext = entry.get("ciphertext")?.as_str()?;
    let iv = entry.get("iv")?.as_str()?;
    if ciphertext.is_empty() || iv.is_empty() {
        return None;
    }
    Some(SealedField {
        ciphertext: ciphertext.to_string(),
        iv: iv.to_string(),
    })
}

/// Build an envelope for the holder of `public_key_hex`.
pub fn seal<'a, I>(
    params: I,
    code: Option<&str>,
    public_key_hex: &str,
) -> Result<Value, EnvelopeError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let public_key =
        hex::decode(public_key_hex.trim()).map_err(|err| EnvelopeError::Seal(err.to_string()))?;
    let session = SessionKey::generate();
    let capsule = ecies::encrypt(&public_key, session.raw())
        .map_err(|_| EnvelopeError::Seal("invalid public key".to_string()))?;

    let mut data = Map::new();
    for (name, value) in params {
        let field = session.seal(value).map_err(|source| EnvelopeError::Param {
            name: name.to_string(),
            source,
        })?;
        data.insert(name.to_string(), field_json(&field));
    }

    let mut envelope = Map::new();
    envelope.insert(
        "capsules".to_string(),
        serde_json::json!({ "box": STANDARD.encode(capsule) }),
    );
    envelope.insert("data".to_string(), Value::Object(data));
    if let Some(code) = code {
        let field = session.seal(code).map_err(EnvelopeError::Code)?;
        envelope.insert("code".to_string(), field_json(&field));
    }
    Ok(Value::Object(envelope))
}

fn field_json(field: &SealedField) -> Value {
    serde_json::json!({ "ciphertext": field.ciphertext, "iv": field.iv })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> KeyStore {
        KeyStore::from_settings(None, None, false)
    }

    fn sealed(keys: &KeyStore, params: &[(&str, &str)], code: Option<&str>) -> String {
        let public = keys.public_key_hex().expect("ready");
        seal(params.iter().copied(), code, public)
            .expect("seal")
            .to_string()
    }

    #[test]
    fn round_trips_params_and_code() {
        let keys = store();
        let long = "x".repeat(10_000);
        let samples: Vec<(Vec<(&str, &str)>, Option<&str>)> = vec![
            (vec![("apiKey", "sk_live_123")], Some("function main(p) { return p.apiKey; }")),
            (vec![], Some("")),
            (vec![("a", ""), ("b", "ünïcødé ✓"), ("c", "{\"nested\":true}")], None),
            (vec![("long", long.as_str())], Some("// only a comment")),
        ];

        for (params, code) in samples {
            let raw = sealed(&keys, &params, code);
            let unwrapped = try_unwrap_envelope(&raw, &keys)
                .expect("unwrap")
                .expect("envelope");
            let expected: Params = params
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect();
            assert_eq!(unwrapped.params, expected);
            assert_eq!(unwrapped.code.as_deref(), code);
        }
    }

    #[test]
    fn non_envelopes_are_soft_misses() {
        let keys = store();
        for raw in [
            "not json",
            "[1,2,3]",
            r#"{"data":{}}"#,
            r#"{"capsules":{"owner":"x"},"data":{}}"#,
            r#"{"capsules":{"box":"AAAA"}}"#,
            r#"{"capsules":{"box":"AAAA"},"code":null}"#,
        ] {
            assert!(
                try_unwrap_envelope(raw, &keys).expect("soft miss").is_none(),
                "{raw}"
            );
        }
    }

    #[test]
    fn bad_capsule_is_a_hard_error() {
        let keys = store();
        let raw = json!({ "capsules": { "box": "AAAA" }, "data": {} }).to_string();
        assert!(matches!(
            try_unwrap_envelope(&raw, &keys),
            Err(EnvelopeError::Capsule(_))
        ));
    }

    #[test]
    fn envelope_for_another_server_fails() {
        let ours = store();
        let theirs = KeyStore::from_settings(
            Some("8f2a55949038a9610f50fb23b5883af3b4ecb3c3bb792cbcefbd1542c692be63"),
            None,
            true,
        );
        let raw = sealed(&theirs, &[("k", "v")], None);
        assert!(matches!(
            try_unwrap_envelope(&raw, &ours),
            Err(EnvelopeError::Capsule(KeyError::Decrypt))
        ));
    }

    #[test]
    fn one_tampered_param_fails_the_whole_unwrap() {
        let keys = store();
        let raw = sealed(&keys, &[("good", "1"), ("bad", "2")], Some("code"));
        let mut envelope: Value = serde_json::from_str(&raw).expect("json");
        envelope["data"]["bad"]["iv"] = json!(STANDARD.encode([7u8; 12]));

        let err = try_unwrap_envelope(&envelope.to_string(), &keys).expect_err("tampered");
        assert!(matches!(&err, EnvelopeError::Param { name, .. } if name == "bad"));
        assert_eq!(err.to_string(), "Failed to decrypt param bad");
    }

    #[test]
    fn tampered_code_fails() {
        let keys = store();
        let raw = sealed(&keys, &[], Some("function main() {}"));
        let mut envelope: Value = serde_json::from_str(&raw).expect("json");
        envelope["code"]["ciphertext"] = json!(STANDARD.encode(b"garbage-garbage-garbage"));
        let err = try_unwrap_envelope(&envelope.to_string(), &keys).expect_err("tampered");
        assert_eq!(err.to_string(), "Failed to decrypt code");
    }

    #[test]
    fn incomplete_entries_are_skipped() {
        let keys = store();
        let raw = sealed(&keys, &[("kept", "yes")], None);
        let mut envelope: Value = serde_json::from_str(&raw).expect("json");
        envelope["data"]["plain"] = json!({ "ciphertext": "abc" });
        envelope["data"]["other"] = json!("not a field");

        let unwrapped = try_unwrap_envelope(&envelope.to_string(), &keys)
            .expect("unwrap")
            .expect("envelope");
        assert_eq!(unwrapped.params.len(), 1);
        assert_eq!(unwrapped.params["kept"], json!("yes"));
        assert_eq!(unwrapped.code, None);
    }
}
