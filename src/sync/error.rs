use std::error::Error;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncErrorKind {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    AlreadyExists,
    Aborted,
    Unavailable,
    Cancelled,
    ResourceExhausted,
    Unknown,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::NotFound => "sync/not-found",
            SyncErrorKind::PermissionDenied => "sync/permission-denied",
            SyncErrorKind::InvalidArgument => "sync/invalid-argument",
            SyncErrorKind::AlreadyExists => "sync/already-exists",
            SyncErrorKind::Aborted => "sync/aborted",
            SyncErrorKind::Unavailable => "sync/unavailable",
            SyncErrorKind::Cancelled => "sync/cancelled",
            SyncErrorKind::ResourceExhausted => "sync/resource-exhausted",
            SyncErrorKind::Unknown => "sync/unknown",
        }
    }

    /// Whether an error of this kind is worth retrying when nothing more specific is known.
    pub fn default_retryable(&self) -> bool {
        matches!(self, SyncErrorKind::Unavailable | SyncErrorKind::Aborted)
    }
}

/// The only error type that crosses the [`SyncService`](crate::sync::SyncService) boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncError {
    pub kind: SyncErrorKind,
    message: String,
    retryable: bool,
    bytes_committed: Option<u64>,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            bytes_committed: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches the number of bytes the store had durably accepted before an upload failed.
    pub fn with_bytes_committed(mut self, bytes: u64) -> Self {
        self.bytes_committed = Some(bytes);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn bytes_committed(&self) -> Option<u64> {
        self.bytes_committed
    }

    pub fn code_str(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Serialisable `{kind, message, retryable}` payload for callers that forward errors.
    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind,
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: SyncErrorKind,
    pub message: String,
    pub retryable: bool,
}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::PermissionDenied, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::InvalidArgument, message)
}

pub fn already_exists(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::AlreadyExists, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::Unavailable, message)
}

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::Cancelled, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::ResourceExhausted, message)
}

pub fn unknown(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorKind::Unknown, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = not_found("collection shows is gone");
        assert_eq!(err.to_string(), "collection shows is gone (sync/not-found)");
    }

    #[test]
    fn retryable_defaults_follow_kind() {
        assert!(unavailable("offline").retryable());
        assert!(aborted("contention").retryable());
        assert!(!permission_denied("nope").retryable());
        assert!(!resource_exhausted("plan limit").retryable());
        assert!(!unavailable("offline").with_retryable(false).retryable());
    }

    #[test]
    fn payload_serializes_kind_in_kebab_case() {
        let payload = already_exists("props/p1 exists").payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "already-exists");
        assert_eq!(json["retryable"], false);
        assert_eq!(json["message"], "props/p1 exists");
    }

    #[test]
    fn bytes_committed_is_carried() {
        let err = unavailable("connection reset").with_bytes_committed(400);
        assert_eq!(err.bytes_committed(), Some(400));
    }
}
