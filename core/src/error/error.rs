use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("command failed: {0}")]
    Command(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("generation error: {0}")]
    Gen(#[from] GenError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Coarse classification of a failed outbound HTTP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Request,
    Body,
    Decode,
    Unknown,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Request => "request",
            Self::Body => "body",
            Self::Decode => "decode",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成流程的错误分类
///
/// Provider-originated variants display the provider's message verbatim so the
/// dashboard can show it as-is.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("{0}")]
    Config(String),

    #[error("{message}")]
    Transport { kind: TransportKind, message: String },

    #[error("{message}")]
    Protocol { status: Option<u16>, message: String },

    #[error("{0}")]
    Extraction(String),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,
}

/// Stable error codes exposed to HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConfigError,
    TransportError,
    ProtocolError,
    ExtractionError,
    StorageError,
    NotFound,
    InvalidInput,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::ExtractionError => "EXTRACTION_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl GenError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn protocol(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Transport { .. } => ErrorCode::TransportError,
            Self::Protocol { .. } => ErrorCode::ProtocolError,
            Self::Extraction(_) => ErrorCode::ExtractionError,
            Self::Storage { .. } | Self::Serialize(_) => ErrorCode::StorageError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Failures of a single provider attempt; these are retried by the scheduler.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Protocol { .. } | Self::Extraction(_)
        )
    }
}

pub type GenResult<T> = Result<T, GenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_displays_provider_message() {
        let err = GenError::protocol(Some(429), "rate limited");
        assert_eq!(err.to_string(), "rate limited");
        assert_eq!(err.error_code(), ErrorCode::ProtocolError);
        assert!(err.is_attempt_failure());
    }

    #[test]
    fn test_storage_error_mentions_path() {
        let err = GenError::storage(
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/state.json"));
        assert!(msg.contains("denied"));
        assert!(!err.is_attempt_failure());
    }
}
