//! SQLite-backed store implementation.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users(
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    pass_hash TEXT NOT NULL,
    quota_bytes INTEGER NOT NULL,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS files(
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(user_id, name),
    FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS files_user_name ON files(user_id, name);
";

/// One row of the `users` table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub pass_hash: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
}

/// One row of the `files` table, as seen by the scrub.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileRow {
    pub name: String,
    pub size: u64,
}

/// Result of an upsert: what was there before and how `used_bytes` moved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Upsert {
    /// Size previously recorded under this name, if any.
    pub old_size: Option<u64>,
    /// `new_size - old_size` as applied to `used_bytes`.
    pub delta: i64,
}

/// Handle to the metadata database.
///
/// Internally serialized: one connection behind a mutex, each public
/// operation a single transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema and pragmas.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self::init(Connection::open(path)?)?;
        tracing::debug!(path = %path.display(), "metadata store opened");
        Ok(store)
    }

    /// Opens a private in-memory database. Test support.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new user. Fails with [`StoreError::UsernameTaken`] when the
    /// username is registered already; returns the new user id otherwise.
    pub fn signup(
        &self,
        username: &str,
        pass_hash: &str,
        quota_bytes: u64,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO users(username, pass_hash, quota_bytes, created_at)
             VALUES(?1, ?2, ?3, strftime('%s','now'))",
            params![username, pass_hash, quota_bytes as i64],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::UsernameTaken)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Looks a user up by name.
    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, username, pass_hash, quota_bytes, used_bytes
                 FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Every registered user, in id order. Scrub support.
    pub fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, pass_hash, quota_bytes, used_bytes
             FROM users ORDER BY id",
        )?;
        let rows = stmt.query_map([], user_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// File names belonging to `user_id`, ascending.
    pub fn list_files(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM files WHERE user_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// File rows with sizes for `user_id`, ascending by name. Scrub support.
    pub fn files(&self, user_id: i64) -> Result<Vec<FileRow>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, size FROM files WHERE user_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(FileRow {
                name: row.get(0)?,
                size: size_from(row.get::<_, i64>(1)?),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Writes (or overwrites) the row for `(user_id, name)` with `new_size`
    /// and moves `used_bytes` by the difference, enforcing the quota in the
    /// same transaction: growth past `quota_bytes` rolls back with
    /// [`StoreError::QuotaExceeded`].
    pub fn upsert_file(
        &self,
        user_id: i64,
        name: &str,
        new_size: u64,
    ) -> Result<Upsert, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (quota, used) = quota_used(&tx, user_id)?;
        let old_size: Option<i64> = tx
            .query_row(
                "SELECT size FROM files WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                |row| row.get(0),
            )
            .optional()?;

        let delta = new_size as i64 - old_size.unwrap_or(0);
        if delta > 0 && used + delta > quota {
            return Err(StoreError::QuotaExceeded);
        }

        tx.execute(
            "INSERT INTO files(user_id, name, size, created_at)
             VALUES(?1, ?2, ?3, strftime('%s','now'))
             ON CONFLICT(user_id, name) DO UPDATE SET size = excluded.size",
            params![user_id, name, new_size as i64],
        )?;
        tx.execute(
            "UPDATE users SET used_bytes = used_bytes + ?1 WHERE id = ?2",
            params![delta, user_id],
        )?;
        tx.commit()?;

        Ok(Upsert {
            old_size: old_size.map(size_from),
            delta,
        })
    }

    /// Removes the row for `(user_id, name)` and subtracts its size from
    /// `used_bytes`. Returns the removed size, or `None` when there was no
    /// such row.
    pub fn delete_file(&self, user_id: i64, name: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let old_size: Option<i64> = tx
            .query_row(
                "SELECT size FROM files WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(size) = old_size else {
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM files WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
        )?;
        tx.execute(
            "UPDATE users SET used_bytes = used_bytes - ?1 WHERE id = ?2",
            params![size, user_id],
        )?;
        tx.commit()?;

        Ok(Some(size_from(size)))
    }

    /// Moves `used_bytes` by `delta`, optionally refusing adjustments that
    /// would exceed the quota. Pre-check support; the upload path enforces
    /// its quota through [`Store::upsert_file`].
    pub fn adjust_used(
        &self,
        user_id: i64,
        delta: i64,
        enforce_quota: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (quota, used) = quota_used(&tx, user_id)?;
        if enforce_quota && used + delta > quota {
            return Err(StoreError::QuotaExceeded);
        }

        tx.execute(
            "UPDATE users SET used_bytes = used_bytes + ?1 WHERE id = ?2",
            params![delta, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Recomputes `used_bytes` as the sum of the user's file rows and
    /// returns the new value. Scrub support.
    pub fn recompute_used(&self, user_id: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE users
             SET used_bytes = (SELECT COALESCE(SUM(size), 0) FROM files WHERE user_id = ?1)
             WHERE id = ?1",
            params![user_id],
        )?;
        let used: i64 = tx.query_row(
            "SELECT used_bytes FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(size_from(used))
    }
}

fn quota_used(conn: &Connection, user_id: i64) -> Result<(i64, i64), StoreError> {
    conn.query_row(
        "SELECT quota_bytes, used_bytes FROM users WHERE id = ?1",
        params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or(StoreError::UnknownUser(user_id))
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        pass_hash: row.get(2)?,
        quota_bytes: size_from(row.get::<_, i64>(3)?),
        used_bytes: size_from(row.get::<_, i64>(4)?),
    })
}

/// Sizes are stored as SQLite integers; anything negative would be a broken
/// invariant, clamp rather than wrap.
fn size_from(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
