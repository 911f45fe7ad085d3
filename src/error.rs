//! Error types for chain recording and replay.

use thiserror::Error;

/// Coarse classification of [`ChainError`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, empty or mistyped record line.
    Format,
    /// The chain was recorded against a different graph.
    Integrity,
    /// The codec pipeline failed or exited non-zero.
    Process,
    /// Filesystem or network failure.
    Io,
    /// The chain catalog could not be read or written.
    Catalog,
    /// The API was used out of order or misconfigured.
    Usage,
}

/// Main error type for chain operations.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid record on line {line}: {reason}")]
    Format { line: u64, reason: String },

    #[error("Graph hash mismatch: chain was recorded on {expected}, got {got}")]
    GraphMismatch { expected: String, got: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Failed to spawn codec stage {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Codec stage {stage} exited with {}", describe_exit(.code))]
    ProcessExit { stage: String, code: Option<i32> },

    #[error("Codec was terminated")]
    Terminated,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Access denied by chain server")]
    Unauthorized,

    #[error("Chain server rejected upload with status {status}")]
    UploadRejected { status: u16 },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ChainError {
    pub(crate) fn format(line: u64, reason: impl Into<String>) -> Self {
        ChainError::Format {
            line,
            reason: reason.into(),
        }
    }

    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Format { .. } => ErrorKind::Format,
            ChainError::GraphMismatch { .. } | ChainError::InvalidGraph(_) => ErrorKind::Integrity,
            ChainError::Spawn { .. } | ChainError::ProcessExit { .. } | ChainError::Terminated => {
                ErrorKind::Process
            }
            ChainError::Io(_)
            | ChainError::Http(_)
            | ChainError::Unauthorized
            | ChainError::UploadRejected { .. } => ErrorKind::Io,
            ChainError::Catalog(_) | ChainError::Serialization(_) => ErrorKind::Catalog,
            ChainError::InvalidState(_) | ChainError::Config(_) => ErrorKind::Usage,
        }
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(e: serde_json::Error) -> Self {
        ChainError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(e: rusqlite::Error) -> Self {
        ChainError::Catalog(e.to_string())
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        ChainError::Http(e.to_string())
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Result type for chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ChainError::format(3, "bad").kind(), ErrorKind::Format);
        assert_eq!(
            ChainError::GraphMismatch {
                expected: "a".into(),
                got: "b".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(ChainError::Terminated.kind(), ErrorKind::Process);
        assert_eq!(ChainError::Unauthorized.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_process_exit_message() {
        let err = ChainError::ProcessExit {
            stage: "xz".into(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "Codec stage xz exited with status 2");

        let err = ChainError::ProcessExit {
            stage: "xz".into(),
            code: None,
        };
        assert_eq!(err.to_string(), "Codec stage xz exited with a signal");
    }
}
