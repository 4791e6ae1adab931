//! Error taxonomy for the control plane and JSON error responses for the control API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by the control plane
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The stored template is not well-formed; aborts the whole synthesis
    #[error("template parse error: {0}")]
    TemplateParse(#[source] serde_json::Error),

    /// A single routing rule could not be parsed; the rule is skipped
    #[error("rule '{tag}' could not be parsed: {source}")]
    RuleParse {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// The registration endpoint answered with a body we cannot use
    #[error("malformed registration response: {0}")]
    MalformedResponse(String),

    /// Connection, timeout or 5xx failure talking to the registration endpoint
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-retryable HTTP status from the registration endpoint
    #[error("registration endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Every attempt allowed by the retry policy failed
    #[error("all {attempts} attempts failed: {last}")]
    AllAttemptsFailed {
        attempts: u32,
        #[source]
        last: Box<ControlError>,
    },

    /// The relay process is not running
    #[error("relay is not running")]
    NotRunning,

    /// The relay process could not be started
    #[error("failed to start relay: {0}")]
    StartFailed(String),

    /// The relay process could not be stopped
    #[error("failed to stop relay: {0}")]
    StopFailed(String),

    /// No registration credential is stored yet
    #[error("no registration credential stored")]
    MissingCredential,

    /// A key handed to the registration client is not a 32-byte base64 value
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Failure in one of the external stores
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Store(err)
    }
}

impl ControlError {
    /// Whether the registration retry loop should try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, ControlError::Transport(_))
    }

    /// Map to the error code reported by the control API
    pub fn code(&self) -> ErrorCode {
        match self {
            ControlError::TemplateParse(_) | ControlError::RuleParse { .. } => {
                ErrorCode::ConfigError
            }
            ControlError::MalformedResponse(_)
            | ControlError::Transport(_)
            | ControlError::Status { .. }
            | ControlError::AllAttemptsFailed { .. } => ErrorCode::RegistrationFailed,
            ControlError::NotRunning => ErrorCode::NotRunning,
            ControlError::StartFailed(_) => ErrorCode::StartFailed,
            ControlError::StopFailed(_) => ErrorCode::StopFailed,
            ControlError::MissingCredential => ErrorCode::MissingCredential,
            ControlError::InvalidKey(_) => ErrorCode::BadRequest,
            ControlError::Store(_) => ErrorCode::InternalError,
        }
    }
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

/// Why the last relay process instance is gone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessFailure {
    /// The process exited on its own
    #[error("relay exited unexpectedly (code: {code:?}, signal: {signal:?})")]
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process never came up
    #[error("relay failed to start: {message}")]
    StartFailed { message: String },
}

/// Error codes reported by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request body or parameters
    BadRequest,
    /// Unknown route
    NotFound,
    /// The template or a rule could not be turned into a config
    ConfigError,
    /// The registration endpoint could not be used
    RegistrationFailed,
    /// The relay is not running
    NotRunning,
    /// The relay could not be started
    StartFailed,
    /// The relay could not be stopped
    StopFailed,
    /// No registration credential is stored
    MissingCredential,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ConfigError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RegistrationFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::NotRunning => StatusCode::CONFLICT,
            ErrorCode::StartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StopFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::MissingCredential => StatusCode::PRECONDITION_FAILED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::RegistrationFailed => "REGISTRATION_FAILED",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::StartFailed => "START_FAILED",
            ErrorCode::StopFailed => "STOP_FAILED",
            ErrorCode::MissingCredential => "MISSING_CREDENTIAL",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a JSON error response for the control API
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

impl From<&ControlError> for Response<Full<Bytes>> {
    fn from(err: &ControlError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
