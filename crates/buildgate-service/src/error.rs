use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caching::Interrupted;

/// An error returned to callers of the gateway.
///
/// The variants mirror the status codes of the execution protocol, so that they can be forwarded
/// to clients without losing their meaning. Every variant carries a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The request is malformed, for example an invalid instance name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The caller could not be authenticated.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The caller is authenticated, but not allowed to perform the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// No backend or resource exists for the request.
    #[error("not found: {0}")]
    NotFound(String),
    /// A remote service could not be reached or returned a server error.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The caller gave up waiting, either by cancellation or timeout.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// An unexpected error in the gateway itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(msg)
            | Self::Unauthenticated(msg)
            | Self::PermissionDenied(msg)
            | Self::NotFound(msg)
            | Self::Unavailable(msg)
            | Self::Cancelled(msg)
            | Self::Internal(msg) => msg,
        }
    }

    /// Prefixes the message with `prefix`, keeping the kind of the error.
    pub fn wrap(self, prefix: impl std::fmt::Display) -> Self {
        self.map_message(|msg| format!("{prefix}: {msg}"))
    }

    fn map_message(self, f: impl FnOnce(String) -> String) -> Self {
        match self {
            Self::InvalidArgument(msg) => Self::InvalidArgument(f(msg)),
            Self::Unauthenticated(msg) => Self::Unauthenticated(f(msg)),
            Self::PermissionDenied(msg) => Self::PermissionDenied(f(msg)),
            Self::NotFound(msg) => Self::NotFound(f(msg)),
            Self::Unavailable(msg) => Self::Unavailable(f(msg)),
            Self::Cancelled(msg) => Self::Cancelled(f(msg)),
            Self::Internal(msg) => Self::Internal(f(msg)),
        }
    }

    /// Reconstructs an error from the name returned by [`kind`](Self::kind) and a message.
    pub fn from_kind(kind: &str, message: String) -> Option<Self> {
        Some(match kind {
            "invalid_argument" => Self::InvalidArgument(message),
            "unauthenticated" => Self::Unauthenticated(message),
            "permission_denied" => Self::PermissionDenied(message),
            "not_found" => Self::NotFound(message),
            "unavailable" => Self::Unavailable(message),
            "cancelled" => Self::Cancelled(message),
            "internal" => Self::Internal(message),
            _ => return None,
        })
    }

    /// A short, static name of the kind of error, for use in metrics tags and error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// The JSON body of an error response of the gateway and its backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&GatewayError> for ErrorBody {
    fn from(error: &GatewayError) -> Self {
        Self {
            code: error.kind().to_owned(),
            message: error.message().to_owned(),
        }
    }
}

impl ErrorBody {
    /// Converts the body back into an error, if its code is known.
    pub fn into_error(self) -> Option<GatewayError> {
        GatewayError::from_kind(&self.code, self.message)
    }
}

impl From<Interrupted> for GatewayError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => Self::Cancelled("Context cancelled".into()),
            Interrupted::Abandoned => {
                Self::Internal("Remote decision was abandoned before completion".into())
            }
        }
    }
}
