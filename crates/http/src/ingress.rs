//! `POST /execute`: bounded body read, code and params resolution, then the
//! sandbox. The first failing step answers the request.

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::CONTENT_LENGTH;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use engine::{ExecuteRequest, ExecutionRuntime, IngressLimits};
use envelope::{KeyStore, try_unwrap_envelope};
use http_body_util::BodyExt;
use runtime_core::params::{overlay, params_from_value, serialized_len};
use runtime_core::{BoxError, ErrorKind, ExecutionResult, Params};

use crate::response::{ApiError, success};
use crate::router::AppState;

/// Code and params ready for the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub code: String,
    pub params: Params,
    pub params_bytes: usize,
}

pub async fn execute<R: ExecutionRuntime>(
    State(state): State<AppState<R>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match run(&state, &headers, body).await {
        Ok(result) => success(&result),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn run<R: ExecutionRuntime>(
    state: &AppState<R>,
    headers: &HeaderMap,
    body: Body,
) -> Result<ExecutionResult, BoxError> {
    if !state.keys.is_ready() {
        return Err(BoxError::new(ErrorKind::NotReady, "Server Keys Not Ready"));
    }
    check_declared_length(headers, state.ingress.max_body_bytes)?;
    let bytes = read_body(body, state.ingress.max_body_bytes).await?;
    let request = ExecuteRequest::from_slice(&bytes)
        .map_err(|_| BoxError::new(ErrorKind::InvalidJson, "Invalid JSON body"))?;
    let prepared = resolve(request, &state.keys, &state.ingress)?;

    tracing::info!(
        script_bytes = prepared.code.len(),
        params_bytes = prepared.params_bytes,
        "Executing script"
    );
    state.sandbox.execute(&prepared.code, &prepared.params).await
}

/// Cheap rejection on a declared length, before any body byte is read.
pub fn check_declared_length(headers: &HeaderMap, max_body_bytes: usize) -> Result<(), BoxError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    match declared {
        Some(length) if length > max_body_bytes as u64 => Err(BoxError::new(
            ErrorKind::BodyTooLarge,
            "Request body too large",
        )
        .with_details(serde_json::json!({ "maxBodyBytes": max_body_bytes }))),
        _ => Ok(()),
    }
}

/// Read the body frame by frame, stopping as soon as the running total
/// passes `max_body_bytes`.
pub async fn read_body(mut body: Body, max_body_bytes: usize) -> Result<Bytes, BoxError> {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| {
            tracing::debug!(error = %err, "Body read failed");
            BoxError::new(ErrorKind::InvalidJson, "Request body could not be read")
        })?;
        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        if buffer.len() + chunk.len() > max_body_bytes {
            return Err(BoxError::new(
                ErrorKind::BodyTooLarge,
                "Request body exceeds limit",
            )
            .with_details(serde_json::json!({ "maxBodyBytes": max_body_bytes })));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Work out which code runs and with which params.
///
/// Code precedence: plaintext `code`, else legacy `encryptedCode`; an
/// envelope carrying code overrides both. Params: `params`, then
/// `publicParams`, then the envelope's decrypted params, later keys winning.
pub fn resolve(
    request: ExecuteRequest,
    keys: &KeyStore,
    limits: &IngressLimits,
) -> Result<Prepared, BoxError> {
    let mut code = match (request.plain_code(), request.legacy_ciphertext()) {
        (Some(code), _) => Some(code.to_string()),
        (None, Some(ciphertext)) => Some(keys.decrypt(ciphertext).map_err(|err| {
            tracing::error!(error = %err, "Code decryption failed");
            BoxError::new(ErrorKind::DecryptFail, "Code Decryption Failed")
        })?),
        (None, None) => None,
    };
    check_code_size(code.as_deref(), limits)?;

    let envelope = request.envelope_text();
    let mut params = params_from_value(request.params, "params")?;
    overlay(
        &mut params,
        params_from_value(request.public_params, "publicParams")?,
    );

    if let Some(raw) = envelope {
        match try_unwrap_envelope(&raw, keys) {
            Ok(Some(unwrapped)) => {
                overlay(&mut params, unwrapped.params);
                if let Some(envelope_code) = unwrapped.code.filter(|code| !code.is_empty()) {
                    tracing::debug!("Using code from envelope");
                    check_code_size(Some(&envelope_code), limits)?;
                    code = Some(envelope_code);
                }
            }
            Ok(None) => {
                tracing::warn!("encryptedParams is not an envelope, ignoring it");
            }
            Err(err) => {
                tracing::error!(error = %err, "encryptedParams failed to unwrap");
                return Err(BoxError::new(
                    ErrorKind::DecryptFail,
                    "Encrypted Params Decryption Failed",
                ));
            }
        }
    }

    let params_bytes = serialized_len(&params);
    if params_bytes > limits.max_params_bytes {
        return Err(BoxError::new(ErrorKind::ParamsTooLarge, "Params size exceeds limit")
            .with_details(serde_json::json!({
                "paramsBytes": params_bytes,
                "maxParamsBytes": limits.max_params_bytes,
            })));
    }

    let code = code.ok_or_else(|| BoxError::new(ErrorKind::NoCode, "No code provided"))?;
    Ok(Prepared {
        code,
        params,
        params_bytes,
    })
}

fn check_code_size(code: Option<&str>, limits: &IngressLimits) -> Result<(), BoxError> {
    match code {
        Some(code) if code.len() > limits.max_code_bytes => Err(BoxError::new(
            ErrorKind::CodeTooLarge,
            format!(
                "Code size {} exceeds limit {}",
                code.len(),
                limits.max_code_bytes
            ),
        )),
        _ => Ok(()),
    }
}
