//! Error types for catalog storage.

use std::fmt;

use thiserror::Error;

/// Structured classification for database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// A stored value could not be decoded into its record field.
    Decode,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl DbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Decode,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Decode => "decode",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> DbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return DbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return DbErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked") || message.contains("database is busy") {
        return DbErrorKind::BusyOrLocked;
    }

    DbErrorKind::Other
}

/// Errors raised by [`CharacterStore`](super::CharacterStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification of the failure.
        kind: DbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// A record that was just written could not be read back.
    #[error("character {0} vanished after upsert")]
    Vanished(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Vanished(_) => None,
        }
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(DbErrorKind::BusyOrLocked)
    }
}
