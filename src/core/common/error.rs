//! Error types for doclite.
//!
//! Every failure in the engine is a `DbError`. Each variant maps to a
//! MongoDB wire error code so that command responses can be rendered as
//! `{ok: 0, code, codeName, errmsg}` documents.

use thiserror::Error;

use crate::core::bson::{Document, Value};

/// Main error type for doclite operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// A supplied value is invalid for the operation (wire code 2).
    #[error("{0}")]
    BadValue(String),

    /// A command document could not be interpreted (wire code 9).
    #[error("{0}")]
    FailedToParse(String),

    /// The operation is not permitted in the current state (wire code 20).
    #[error("{0}")]
    IllegalOperation(String),

    /// The named collection does not exist (wire code 26).
    #[error("ns not found: {0}")]
    NamespaceNotFound(String),

    /// The named index does not exist (wire code 27).
    #[error("index not found: {0}")]
    IndexNotFound(String),

    /// The cursor id is unknown, killed, or exhausted (wire code 43).
    #[error("cursor id {0} not found")]
    CursorNotFound(u64),

    /// An index build failed for a reason other than a duplicate key
    /// (wire code 67).
    #[error("{0}")]
    CannotCreateIndex(String),

    /// The collection name is not a valid namespace (wire code 73).
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A retryable operational failure, e.g. a lock acquisition timeout
    /// (wire code 96).
    #[error("{0}")]
    OperationFailed(String),

    /// The logical session does not exist (wire code 206).
    #[error("no such session")]
    NoSuchSession,

    /// The transaction number is not newer than the last one used on the
    /// session (wire code 225).
    #[error("{0}")]
    TransactionTooOld(String),

    /// No transaction with the given number is in progress (wire code 251).
    #[error("{0}")]
    NoSuchTransaction(String),

    /// The transaction has already been committed (wire code 256).
    #[error("{0}")]
    TransactionCommitted(String),

    /// The transaction has been aborted, e.g. as a deadlock victim
    /// (wire code 263).
    #[error("{0}")]
    TransactionAborted(String),

    /// A unique index rejected a duplicate key (wire code 11000).
    #[error("E11000 duplicate key error {0}")]
    DuplicateKey(String),

    /// The document exceeds the maximum BSON size (wire code 17419).
    #[error("document is too large: {0} bytes")]
    DocumentTooLarge(usize),

    /// An invariant was violated inside the engine (wire code 1).
    #[error("internal error: {0}")]
    Internal(String),

    /// A storage layer failure: pager, B+Tree, or codec (wire code 1).
    #[error("storage error: {0}")]
    Storage(String),

    /// Failure reading or parsing the configuration file (wire code 1).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An underlying I/O failure (wire code 1).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// The MongoDB wire error code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::BadValue(_) => 2,
            Self::FailedToParse(_) => 9,
            Self::IllegalOperation(_) => 20,
            Self::NamespaceNotFound(_) => 26,
            Self::IndexNotFound(_) => 27,
            Self::CursorNotFound(_) => 43,
            Self::CannotCreateIndex(_) => 67,
            Self::InvalidNamespace(_) => 73,
            Self::OperationFailed(_) => 96,
            Self::NoSuchSession => 206,
            Self::TransactionTooOld(_) => 225,
            Self::NoSuchTransaction(_) => 251,
            Self::TransactionCommitted(_) => 256,
            Self::TransactionAborted(_) => 263,
            Self::DuplicateKey(_) => 11000,
            Self::DocumentTooLarge(_) => 17419,
            Self::Internal(_) | Self::Storage(_) | Self::Configuration(_) | Self::Io(_) => 1,
        }
    }

    /// The symbolic name matching `code()`.
    #[must_use]
    pub const fn code_name(&self) -> &'static str {
        match self {
            Self::BadValue(_) => "BadValue",
            Self::FailedToParse(_) => "FailedToParse",
            Self::IllegalOperation(_) => "IllegalOperation",
            Self::NamespaceNotFound(_) => "NamespaceNotFound",
            Self::IndexNotFound(_) => "IndexNotFound",
            Self::CursorNotFound(_) => "CursorNotFound",
            Self::CannotCreateIndex(_) => "CannotCreateIndex",
            Self::InvalidNamespace(_) => "InvalidNamespace",
            Self::OperationFailed(_) => "OperationFailed",
            Self::NoSuchSession => "NoSuchSession",
            Self::TransactionTooOld(_) => "TransactionTooOld",
            Self::NoSuchTransaction(_) => "NoSuchTransaction",
            Self::TransactionCommitted(_) => "TransactionCommitted",
            Self::TransactionAborted(_) => "TransactionAborted",
            Self::DuplicateKey(_) => "DuplicateKey",
            Self::DocumentTooLarge(_) => "DocumentTooLarge",
            Self::Internal(_) | Self::Storage(_) | Self::Configuration(_) | Self::Io(_) => {
                "InternalError"
            }
        }
    }

    /// Renders this error as a wire-shaped response document:
    /// `{ok: 0, code, codeName, errmsg}`.
    #[must_use]
    pub fn error_response(&self) -> Document {
        let mut doc = Document::new();
        doc.set("ok", Value::Double(0.0));
        doc.set("code", Value::Int32(self.code()));
        doc.set("codeName", Value::String(self.code_name().to_string()));
        doc.set("errmsg", Value::String(self.to_string()));
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(DbError::BadValue(String::new()).code(), 2);
        assert_eq!(DbError::DuplicateKey(String::new()).code(), 11000);
        assert_eq!(DbError::TransactionAborted(String::new()).code(), 263);
        assert_eq!(DbError::Internal(String::new()).code(), 1);
        assert_eq!(DbError::Storage(String::new()).code_name(), "InternalError");
    }

    #[test]
    fn test_error_response_shape() {
        let err = DbError::CursorNotFound(42);
        let doc = err.error_response();
        assert_eq!(doc.get("ok"), Some(&Value::Double(0.0)));
        assert_eq!(doc.get("code"), Some(&Value::Int32(43)));
        assert_eq!(
            doc.get("codeName"),
            Some(&Value::String("CursorNotFound".to_string()))
        );
        match doc.get("errmsg") {
            Some(Value::String(msg)) => assert!(msg.contains("42")),
            other => panic!("expected errmsg string, got {other:?}"),
        }
    }
}
