//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by [`crate::Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SIGNUP with a username that is already registered.
    #[error("username already exists")]
    UsernameTaken,
    /// The adjustment or upsert would push `used_bytes` past the quota.
    #[error("quota exceeded")]
    QuotaExceeded,
    /// An operation referenced a user id that is not in the store.
    #[error("unknown user id {0}")]
    UnknownUser(i64),
    /// Any other SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
