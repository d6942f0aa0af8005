use serde::Serialize;
use serde_json::Value;

/// Every failure the service can report to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Warm-up failed; the pool refuses all work for the rest of the process.
    IvmUnavailable,
    NotReady,
    QueueFull,
    QueueTimeout,
    BodyTooLarge,
    InvalidJson,
    DecryptFail,
    CodeTooLarge,
    ParamsTooLarge,
    ParamsInvalid,
    NoCode,
    SandboxTimeout,
    ScriptFail,
    ResultNotSerializable,
    SandboxFatal,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 17] = [
        ErrorKind::IvmUnavailable,
        ErrorKind::NotReady,
        ErrorKind::QueueFull,
        ErrorKind::QueueTimeout,
        ErrorKind::BodyTooLarge,
        ErrorKind::InvalidJson,
        ErrorKind::DecryptFail,
        ErrorKind::CodeTooLarge,
        ErrorKind::ParamsTooLarge,
        ErrorKind::ParamsInvalid,
        ErrorKind::NoCode,
        ErrorKind::SandboxTimeout,
        ErrorKind::ScriptFail,
        ErrorKind::ResultNotSerializable,
        ErrorKind::SandboxFatal,
        ErrorKind::Unauthorized,
        ErrorKind::Internal,
    ];

    /// Wire code placed in `error.code`.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::IvmUnavailable => "ERR_IVM_UNAVAILABLE",
            ErrorKind::NotReady => "ERR_NOT_READY",
            ErrorKind::QueueFull => "ERR_QUEUE_FULL",
            ErrorKind::QueueTimeout => "ERR_QUEUE_TIMEOUT",
            ErrorKind::BodyTooLarge => "ERR_BODY_TOO_LARGE",
            ErrorKind::InvalidJson => "ERR_INVALID_JSON",
            ErrorKind::DecryptFail => "ERR_DECRYPT_FAIL",
            ErrorKind::CodeTooLarge => "ERR_CODE_TOO_LARGE",
            ErrorKind::ParamsTooLarge => "ERR_PARAMS_TOO_LARGE",
            ErrorKind::ParamsInvalid => "ERR_PARAMS_INVALID",
            ErrorKind::NoCode => "ERR_NO_CODE",
            ErrorKind::SandboxTimeout => "ERR_SANDBOX_TIMEOUT",
            ErrorKind::ScriptFail => "ERR_SCRIPT_FAIL",
            ErrorKind::ResultNotSerializable => "ERR_RESULT_NOT_SERIALIZABLE",
            ErrorKind::SandboxFatal => "ERR_SANDBOX_FATAL",
            ErrorKind::Unauthorized => "ERR_UNAUTHORIZED",
            ErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            ErrorKind::IvmUnavailable | ErrorKind::NotReady | ErrorKind::QueueTimeout => 503,
            ErrorKind::QueueFull => 429,
            ErrorKind::BodyTooLarge | ErrorKind::CodeTooLarge => 413,
            ErrorKind::InvalidJson
            | ErrorKind::DecryptFail
            | ErrorKind::ParamsTooLarge
            | ErrorKind::ParamsInvalid
            | ErrorKind::NoCode
            | ErrorKind::ScriptFail => 400,
            ErrorKind::SandboxTimeout => 504,
            ErrorKind::Unauthorized => 401,
            ErrorKind::ResultNotSerializable | ErrorKind::SandboxFatal | ErrorKind::Internal => {
                500
            }
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::IvmUnavailable => "Sandbox runtime unavailable",
            ErrorKind::NotReady => "Server keys not initialized",
            ErrorKind::QueueFull => "Server busy, try again later",
            ErrorKind::QueueTimeout => "Timed out waiting for a sandbox",
            ErrorKind::BodyTooLarge => "Request body too large",
            ErrorKind::InvalidJson => "Invalid JSON body",
            ErrorKind::DecryptFail => "Decryption failed",
            ErrorKind::CodeTooLarge => "Code too large",
            ErrorKind::ParamsTooLarge => "Params too large",
            ErrorKind::ParamsInvalid => "Params must be a JSON object",
            ErrorKind::NoCode => "No code provided",
            ErrorKind::SandboxTimeout => "Execution timed out",
            ErrorKind::ScriptFail => "Script failed",
            ErrorKind::ResultNotSerializable => "Result is not serializable",
            ErrorKind::SandboxFatal => "Sandbox execution failed",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Internal => "Internal server error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure carrying a caller-safe message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BoxError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl BoxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    /// Body of an error response: `{ ok: false, error: { code, message, details? } }`.
    pub fn to_body(&self) -> ErrorBody<'_> {
        ErrorBody {
            ok: false,
            error: ErrorPayload {
                code: self.code(),
                message: &self.message,
                details: self.details.as_ref(),
            },
        }
    }
}

impl From<ErrorKind> for BoxError {
    fn from(kind: ErrorKind) -> Self {
        BoxError::new(kind, kind.default_message())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub ok: bool,
    pub error: ErrorPayload<'a>,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload<'a> {
    pub code: &'static str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a Value>,
}
