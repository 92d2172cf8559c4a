//! Canonical status codes.
//!
//! Every error that crosses a component boundary carries one of these
//! codes. The HTTP mapping follows the conventional canonical-code
//! translation; `/git-upload-pack` errors are delivered as pkt-line error
//! packets instead.

use thiserror::Error;

/// Canonical status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    Unimplemented,
    Internal,
    DataLoss,
}

impl Code {
    /// Stable name used as a metrics label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Canceled => "Canceled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::PermissionDenied => "PermissionDenied",
            Code::Unauthenticated => "Unauthenticated",
            Code::Unavailable => "Unavailable",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::DataLoss => "DataLoss",
        }
    }

    /// HTTP status for this code. 499 is the de-facto "client closed
    /// request" status.
    pub fn http_status(&self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::Canceled => 499,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 504,
            Code::NotFound => 404,
            Code::PermissionDenied => 403,
            Code::Unauthenticated => 401,
            Code::Unavailable => 503,
            Code::Unimplemented => 501,
            Code::Unknown | Code::Internal | Code::DataLoss => 500,
        }
    }

    /// Whether this code indicates a server-side failure. Only these are
    /// forwarded to the pluggable error-reporting sink.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Code::DataLoss
                | Code::DeadlineExceeded
                | Code::Internal
                | Code::Unavailable
                | Code::Unknown
        )
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status: canonical code plus a human-readable message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn is_server_error(&self) -> bool {
        self.code.is_server_error()
    }
}

/// Result alias used across the proxy.
pub type StatusResult<T> = std::result::Result<T, Status>;
