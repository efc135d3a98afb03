//! Embedded relational store for users, file records, and quota accounting.
//!
//! The store is SQLite in WAL mode behind a mutexed connection: callers see
//! a set of operations that are each one serializable transaction. Quota
//! enforcement for uploads happens inside the same transaction that updates
//! the file row and the user's `used_bytes`, so concurrent writers can never
//! overshoot a quota between a check and a commit.

mod error;
mod store;

pub use error::StoreError;
pub use store::{FileRow, Store, Upsert, UserRecord};
