//! Error types for ledger operations.

use std::fmt;

use thiserror::Error;

use crate::db::DbError;

/// Structured classification for ledger store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl LedgerDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(
                    code.as_deref(),
                    Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
                ) {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_check_violation()
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for LedgerDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors that can occur while reading or writing the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store could not be opened or migrated.
    #[error("ledger store unavailable: {0}")]
    Unavailable(#[from] DbError),

    /// A query against the store failed.
    #[error("ledger {operation} failed ({kind}): {source}")]
    Database {
        /// Which ledger operation failed.
        operation: &'static str,
        /// Coarse classification of the failure.
        kind: LedgerDbErrorKind,
        /// The underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A counter did not fit the store's integer type.
    #[error("ledger value out of range for {field}: {value}")]
    OutOfRange {
        /// Field being written.
        field: &'static str,
        /// Offending value.
        value: u64,
    },
}

impl LedgerError {
    pub(crate) fn database(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Database {
            operation,
            kind: LedgerDbErrorKind::from_sqlx(&source),
            source,
        }
    }
}
