/*!
 * Error types for objvault
 */

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, VaultError>;

/// Service codes the transfer engine reacts to
pub mod codes {
    pub const NO_SUCH_KEY: &str = "NoSuchKey";
    pub const NO_SUCH_UPLOAD: &str = "NoSuchUpload";
    pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";
    pub const PRECONDITION_FAILED: &str = "PreconditionFailed";
    pub const NOT_MODIFIED: &str = "NotModified";
    pub const INVALID_PART: &str = "InvalidPart";
    pub const INVALID_PART_ORDER: &str = "InvalidPartOrder";
    pub const ENTITY_TOO_SMALL: &str = "EntityTooSmall";
    pub const INVALID_RANGE: &str = "InvalidRange";
    pub const POSITION_NOT_EQUAL_TO_LENGTH: &str = "PositionNotEqualToLength";
    pub const ACCESS_DENIED: &str = "AccessDenied";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    pub const SLOW_DOWN: &str = "SlowDown";
    pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
}

/// Errors surfaced by every public operation
#[derive(Error, Debug, Clone)]
pub enum VaultError {
    /// Local precondition failure; no network call was made
    #[error("Validation failed: {0}")]
    Validate(String),

    /// Crypto setup or material mismatch
    #[error("Encryption client error: {0}")]
    EncryptionClient(String),

    /// Crypto context and remote multipart state disagree
    #[error("Invalid encryption request: {0}")]
    InvalidEncryptionRequest(String),

    /// Remote service rejected the request
    #[error("Service error ({status} {code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    /// Transport-level failure (connection, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// The client has been administratively disabled
    #[error("Client is disabled")]
    ClientDisabled,

    /// A submitted task was cancelled before it ran
    #[error("Task cancelled")]
    Cancelled,

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Aggregate checksum did not match the service
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Error with added context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<VaultError>,
    },
}

impl VaultError {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        VaultError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build a service error from its parts
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        VaultError::Service {
            status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Innermost error, with any context stripped
    pub fn root(&self) -> &VaultError {
        match self {
            VaultError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable error code carried with every failure
    pub fn code(&self) -> &str {
        match self.root() {
            VaultError::Validate(_) => "ValidateError",
            VaultError::EncryptionClient(_) => "EncryptionClientError",
            VaultError::InvalidEncryptionRequest(_) => "InvalidEncryptionRequest",
            VaultError::Service { code, .. } => code,
            VaultError::Network(_) => "NetworkError",
            VaultError::ClientDisabled => "ClientDisabled",
            VaultError::Cancelled => "Cancelled",
            VaultError::Io(_) => "IoError",
            VaultError::Checkpoint(_) => "CheckpointError",
            VaultError::ChecksumMismatch { .. } => "ChecksumMismatch",
            VaultError::WithContext { .. } => "Unknown",
        }
    }

    /// HTTP status of a service error
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            VaultError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True if the remote service answered with the given code
    pub fn has_service_code(&self, expected: &str) -> bool {
        matches!(self.root(), VaultError::Service { code, .. } if code == expected)
    }

    /// Check if error is retryable at the request level
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::Network(_) => true,
            VaultError::Service { status, code, .. } => {
                *status >= 500 || is_retryable_code(code)
            }
            VaultError::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error was produced locally before any network call
    pub fn is_client_side(&self) -> bool {
        matches!(
            self.root(),
            VaultError::Validate(_)
                | VaultError::EncryptionClient(_)
                | VaultError::InvalidEncryptionRequest(_)
                | VaultError::ClientDisabled
                | VaultError::Cancelled
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            VaultError::Validate(_) => ErrorCategory::Validation,
            VaultError::EncryptionClient(_) | VaultError::InvalidEncryptionRequest(_) => {
                ErrorCategory::Encryption
            }
            VaultError::Service { .. } => ErrorCategory::Service,
            VaultError::Network(_) => ErrorCategory::Network,
            VaultError::ClientDisabled | VaultError::Cancelled => ErrorCategory::Lifecycle,
            VaultError::Io(_) => ErrorCategory::IoError,
            VaultError::Checkpoint(_) => ErrorCategory::Resume,
            VaultError::ChecksumMismatch { .. } => ErrorCategory::Integrity,
            VaultError::WithContext { .. } => ErrorCategory::Unknown,
        }
    }
}

/// Check if a service error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        codes::REQUEST_TIMEOUT | codes::SERVICE_UNAVAILABLE | codes::INTERNAL_ERROR | codes::SLOW_DOWN
    )
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local precondition failures
    Validation,
    /// Envelope encryption failures
    Encryption,
    /// Remote service rejections
    Service,
    /// Transport failures
    Network,
    /// Client disabled or task cancelled
    Lifecycle,
    /// Local I/O errors
    IoError,
    /// Checkpoint persistence errors
    Resume,
    /// Data integrity errors
    Integrity,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Encryption => write!(f, "encryption"),
            ErrorCategory::Service => write!(f, "service"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Lifecycle => write!(f, "lifecycle"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Resume => write!(f, "resume"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        VaultError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Checkpoint(format!("JSON error: {}", err))
    }
}
