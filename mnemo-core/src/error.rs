//! # Error Handling
//!
//! Error types for MnemoDB operations.
//!
//! Errors fall into three families:
//!
//! 1. **Validation**: caused by the client (bad names, type conflicts,
//!    malformed wire values). Never retried, abort only the current call.
//! 2. **Storage**: caused by the environment (object store I/O, corrupt
//!    segments). Fatal during replay, retried during WAL flush.
//! 3. **Internal**: broken invariants. These indicate bugs.

use thiserror::Error;

/// Result type alias for MnemoDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for MnemoDB
#[derive(Error, Debug)]
pub enum Error {
    // Validation Errors
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("schema validation error: {message}")]
    SchemaValidation { message: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("invalid {type_name} value {value:?}: {reason}")]
    InvalidValue {
        value: String,
        type_name: String,
        reason: String,
    },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("record of {size} bytes exceeds the WAL entry limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    // Storage Errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("object store error on {object}: {message}")]
    ObjectStore { object: String, message: String },

    #[error("WAL error: {message}")]
    WriteAheadLog {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("corruption detected in {object}: {details}")]
    Corruption { object: String, details: String },

    #[error("compression failed: {message}")]
    Compression { message: String },

    #[error("WAL manager has been terminated")]
    WalTerminated,

    #[error("buffer overflow: need {requested} bytes, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    // System Errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Client-caused errors. These are reported to the caller as-is and
    /// leave engine state untouched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::TableNotFound { .. }
                | Error::ColumnNotFound { .. }
                | Error::SchemaValidation { .. }
                | Error::TypeMismatch { .. }
                | Error::InvalidValue { .. }
                | Error::InvalidName { .. }
                | Error::InvalidQuery { .. }
                | Error::RecordTooLarge { .. }
                | Error::Checkpoint { .. }
        )
    }

    /// Transient failures worth retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::ObjectStore { .. } => true,
            Error::Io { .. } => true,
            Error::Corruption { .. } => false,
            Error::Compression { .. } => false,
            Error::Internal { .. } => false,
            Error::WalTerminated => false,
            _ => true,
        }
    }

    /// Stable identifier for logs and tooling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::TableNotFound { .. } => "TABLE_NOT_FOUND",
            Error::ColumnNotFound { .. } => "COLUMN_NOT_FOUND",
            Error::SchemaValidation { .. } => "SCHEMA_VALIDATION_ERROR",
            Error::TypeMismatch { .. } => "TYPE_MISMATCH",
            Error::InvalidValue { .. } => "INVALID_VALUE",
            Error::InvalidName { .. } => "INVALID_NAME",
            Error::InvalidQuery { .. } => "INVALID_QUERY",
            Error::RecordTooLarge { .. } => "RECORD_TOO_LARGE",
            Error::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::ObjectStore { .. } => "OBJECT_STORE_ERROR",
            Error::WriteAheadLog { .. } => "WAL_ERROR",
            Error::Corruption { .. } => "CORRUPTION",
            Error::Compression { .. } => "COMPRESSION_ERROR",
            Error::WalTerminated => "WAL_TERMINATED",
            Error::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn invalid_value(
        value: impl Into<String>,
        type_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidValue {
            value: value.into(),
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Error::SchemaValidation {
            message: message.into(),
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            e if e.is_validation() => e,
            e => Error::Internal {
                message: format!("{}: {}", f(), e),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        let err = Error::TableNotFound { table: "t".into() };
        assert!(err.is_validation());
        assert_eq!(err.error_code(), "TABLE_NOT_FOUND");

        let err = Error::Corruption {
            object: "wal.log.0".into(),
            details: "bad magic".into(),
        };
        assert!(!err.is_validation());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_with_context_keeps_validation_errors() {
        let r: Result<()> = Err(Error::ColumnNotFound { column: "a".into() });
        let err = r.with_context(|| "query".to_string()).unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));

        let r: Result<()> = Err(Error::Compression { message: "x".into() });
        let err = r.with_context(|| "flush".to_string()).unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn test_invalid_value_message_embeds_value_and_type() {
        let err = Error::invalid_value("zz", "INT32", "not a hex string");
        let msg = err.to_string();
        assert!(msg.contains("zz"));
        assert!(msg.contains("INT32"));
    }
}
