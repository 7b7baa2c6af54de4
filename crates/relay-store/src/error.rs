//! Store error types.

use thiserror::Error;

/// SQLSTATE raised when a unique constraint is violated.
pub const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE raised when a row-level security policy or grant rejects a statement.
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Errors surfaced by the store and by transaction contexts.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A context handle was used after its transaction finished.
    #[error("transaction context used after its transaction finished")]
    ContextInvalidated,

    /// The statement violated a unique constraint.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    /// The statement was rejected by a permission check.
    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    /// No connection could be acquired from the pool.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Any other database error, with its SQLSTATE when known.
    #[error("database error{}: {message}", code_suffix(.code))]
    Database {
        code: Option<String>,
        message: String,
    },

    /// A row could not be decoded into the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The transaction could not be rolled back.
    #[error("rollback failed: {0}")]
    Rollback(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default()
}

impl StoreError {
    /// Build an error from a SQLSTATE code, classifying the well-known ones.
    pub fn from_sqlstate(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some(UNIQUE_VIOLATION) => Self::UniqueViolation(message),
            Some(INSUFFICIENT_PRIVILEGE) => Self::InsufficientPrivilege(message),
            other => Self::Database {
                code: other.map(str::to_owned),
                message,
            },
        }
    }

    /// The SQLSTATE associated with this error, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::UniqueViolation(_) => Some(UNIQUE_VIOLATION),
            Self::InsufficientPrivilege(_) => Some(INSUFFICIENT_PRIVILEGE),
            Self::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                Self::from_sqlstate(db.code().as_deref(), db.message().to_owned())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Pool(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
                Self::Decode(err.to_string())
            }
            _ => Self::Database {
                code: None,
                message: err.to_string(),
            },
        }
    }
}
