use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resource[-_ ]?exhausted|quota|rate[-_ ]?limit").unwrap()
});

static PERMISSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission[-_ ]?denied|unauthenticated|insufficient permissions").unwrap()
});

static UNAVAILABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unavailable|deadline[-_ ]?exceeded|network|timed? ?out|offline").unwrap()
});

/// Failure class of a remote store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The store rejected the operation because a resource budget ran out.
    QuotaExceeded,
    PermissionDenied,
    Unavailable,
    Other,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota-exceeded",
            Self::PermissionDenied => "permission-denied",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        }
    }
}

/// An error reported by the remote store collaborator, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} ({})", message, kind.as_str())]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::QuotaExceeded, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    /// Classify a raw error coming out of a store client.
    ///
    /// The status code wins when it is one of the well-known ones; otherwise the
    /// message text is inspected.
    pub fn classify(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match code.map(|c| c.trim().to_ascii_lowercase()) {
            Some(c) if c == "resource-exhausted" || c == "resource_exhausted" || c == "429" => {
                RemoteErrorKind::QuotaExceeded
            }
            Some(c) if c == "permission-denied" || c == "unauthenticated" || c == "403" => {
                RemoteErrorKind::PermissionDenied
            }
            Some(c) if c == "unavailable" || c == "deadline-exceeded" || c == "503" => {
                RemoteErrorKind::Unavailable
            }
            _ => classify_message(&message),
        };
        Self { kind, message }
    }

    pub fn is_quota(&self) -> bool {
        self.kind == RemoteErrorKind::QuotaExceeded
    }
}

fn classify_message(message: &str) -> RemoteErrorKind {
    if QUOTA_RE.is_match(message) {
        RemoteErrorKind::QuotaExceeded
    } else if PERMISSION_RE.is_match(message) {
        RemoteErrorKind::PermissionDenied
    } else if UNAVAILABLE_RE.is_match(message) {
        RemoteErrorKind::Unavailable
    } else {
        RemoteErrorKind::Other
    }
}

/// Failure of the local fallback store.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("fallback value for {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode fallback value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure returned from the mutation API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Reported once per session; the engine keeps running against the fallback store.
    #[error("remote quota exhausted, working offline")]
    QuotaExceeded,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("remote store failure: {0}")]
    Remote(String),
    #[error(transparent)]
    Fallback(#[from] FallbackError),
    #[error("engine has stopped")]
    Stopped,
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::QuotaExceeded => Self::QuotaExceeded,
            RemoteErrorKind::PermissionDenied => Self::PermissionDenied(err.message),
            RemoteErrorKind::Unavailable | RemoteErrorKind::Other => Self::Remote(err.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_takes_precedence() {
        let err = RemoteError::classify(Some("resource-exhausted"), "something odd");
        assert_eq!(err.kind, RemoteErrorKind::QuotaExceeded);

        let err = RemoteError::classify(Some("permission-denied"), "quota in text");
        assert_eq!(err.kind, RemoteErrorKind::PermissionDenied);
    }

    #[test]
    fn message_heuristics() {
        assert!(RemoteError::classify(None, "Quota exceeded.").is_quota());
        assert_eq!(
            RemoteError::classify(None, "Missing or insufficient permissions.").kind,
            RemoteErrorKind::PermissionDenied
        );
        assert_eq!(
            RemoteError::classify(None, "client is offline").kind,
            RemoteErrorKind::Unavailable
        );
        assert_eq!(
            RemoteError::classify(Some("aborted"), "transaction aborted").kind,
            RemoteErrorKind::Other
        );
    }

    #[test]
    fn engine_error_mapping() {
        assert!(matches!(
            EngineError::from(RemoteError::quota("x")),
            EngineError::QuotaExceeded
        ));
        match EngineError::from(RemoteError::permission("nope")) {
            EngineError::PermissionDenied(msg) => assert_eq!(msg, "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
