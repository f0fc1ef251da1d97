use std::fmt;
use std::time::Duration;

/// Migration error types.
///
/// Only setup failures ever terminate a run. Everything a worker hits while
/// processing a window is contained and turned into counters, so most of
/// these variants end up as log lines rather than exit codes.
#[derive(Debug)]
pub enum MigrationError {
    /// Database-related errors from either store.
    Database(sqlx::Error),
    /// A store call did not finish within its timeout.
    Timeout {
        /// What was being attempted.
        operation: String,
        /// Configured timeout.
        after: Duration,
    },
    /// A recoverable failure reported by a store implementation.
    Transient(String),
    /// A non-recoverable failure reported by a store implementation
    /// (constraint violation, malformed payload).
    Store(String),
    /// Missing reference data or connectivity; aborts the run.
    Setup(String),
    /// Checkpoint file could not be read or written.
    Checkpoint(String),
    /// Filesystem error.
    Io(std::io::Error),
    /// JSON (de)serialization error.
    Serialization(serde_json::Error),
    /// A transient error persisted through every retry attempt.
    RetryExhausted {
        /// What was being attempted.
        operation: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Display form of the final error.
        last_error: String,
    },
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<MigrationError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {}", e),
            MigrationError::Timeout { operation, after } => {
                write!(f, "Timed out after {:?}: {}", after, operation)
            }
            MigrationError::Transient(msg) => write!(f, "Transient store error: {}", msg),
            MigrationError::Store(msg) => write!(f, "Store error: {}", msg),
            MigrationError::Setup(msg) => write!(f, "Setup failed: {}", msg),
            MigrationError::Checkpoint(msg) => write!(f, "Checkpoint error: {}", msg),
            MigrationError::Io(e) => write!(f, "I/O error: {}", e),
            MigrationError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MigrationError::RetryExhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "{} failed after {} attempts: {}",
                operation, attempts, last_error
            ),
            MigrationError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Database(e) => Some(e),
            MigrationError::Io(e) => Some(e),
            MigrationError::Serialization(e) => Some(e),
            MigrationError::WithContext { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl MigrationError {
    /// Whether the failed call is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrationError::Timeout { .. } | MigrationError::Transient(_) => true,
            MigrationError::Database(e) => is_transient_sqlx(e),
            MigrationError::WithContext { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether the error is a uniqueness violation on the natural key.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            MigrationError::Database(sqlx::Error::Database(db_err)) => {
                db_err.is_unique_violation()
            }
            MigrationError::WithContext { source, .. } => source.is_unique_violation(),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| {
                code.starts_with("08")
                    || matches!(&*code, "40001" | "40P01" | "55P03" | "57014")
            })
            .unwrap_or(false),
        _ => false,
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err)
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io(err)
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        MigrationError::Serialization(err)
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `MigrationError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, MigrationError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, MigrationError> {
    fn context(self, context: impl Into<String>) -> Result<T, MigrationError> {
        self.map_err(|e| MigrationError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| MigrationError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, MigrationError> {
        self.map_err(|e| MigrationError::WithContext {
            source: Box::new(MigrationError::Database(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, MigrationError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| MigrationError::WithContext {
            source: Box::new(MigrationError::Database(e)),
            context: f(),
        })
    }
}
