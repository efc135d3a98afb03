//! Hierarchical reader/writer lock manager.
//!
//! Locks are named: `U:<user>` serializes a user's mutating operations
//! against each other and against LIST, `F:<user>|<file>` serializes
//! operations on one file. Entries are interned in a single map and
//! reference-counted so concurrent acquires of the same key share one
//! rw-lock instance; the entry disappears when the last holder releases.
//!
//! Ordering rule, enforced by every caller: user lock before file lock,
//! released in reverse. The map mutex protects only lookup and refcounts;
//! the rw-lock itself is always taken outside it.

use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use rustc_hash::FxHashMap;

/// How a lock is to be held.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Shared with other readers.
    Shared,
    /// Exclusive.
    Exclusive,
}

/// Identity of a lock entry.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LockKey {
    User(String),
    File(String, String),
}

struct Entry {
    refs: usize,
    lock: Arc<RwLock<()>>,
}

/// Interning lock registry shared by all workers.
#[derive(Default)]
pub struct LockManager {
    entries: Mutex<FxHashMap<LockKey, Entry>>,
}

enum Held {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// RAII hold on one named lock.
///
/// Dropping the guard releases the rw-lock first and then drops the entry
/// reference, removing the entry when it was the last one.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: LockKey,
    held: Option<Held>,
}

impl LockManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the user-level lock for `username`.
    pub fn lock_user(&self, username: &str, mode: LockMode) -> LockGuard<'_> {
        self.acquire(LockKey::User(username.to_owned()), mode)
    }

    /// Acquires the file-level lock for `(username, name)`.
    ///
    /// Callers holding both levels must take the user lock first.
    pub fn lock_file(&self, username: &str, name: &str, mode: LockMode) -> LockGuard<'_> {
        self.acquire(LockKey::File(username.to_owned(), name.to_owned()), mode)
    }

    fn acquire(&self, key: LockKey, mode: LockMode) -> LockGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                refs: 0,
                lock: Arc::new(RwLock::new(())),
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        // Block outside the map mutex.
        let held = match mode {
            LockMode::Shared => Held::Shared(lock.read_arc()),
            LockMode::Exclusive => Held::Exclusive(lock.write_arc()),
        };

        LockGuard {
            manager: self,
            key,
            held: Some(held),
        }
    }

    fn release(&self, key: &LockKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }

    /// Number of live lock entries. Test support.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Release the rw-lock before touching the map.
        self.held.take();
        self.manager.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn entries_appear_and_disappear_with_holders() {
        let mgr = LockManager::new();
        assert_eq!(mgr.entry_count(), 0);
        {
            let _user = mgr.lock_user("alice", LockMode::Exclusive);
            let _file = mgr.lock_file("alice", "a.txt", LockMode::Exclusive);
            assert_eq!(mgr.entry_count(), 2);
        }
        assert_eq!(mgr.entry_count(), 0);
    }

    #[test]
    fn same_key_shares_one_lock_instance() {
        let mgr = Arc::new(LockManager::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let concurrent = Arc::clone(&concurrent);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _g = mgr.lock_file("bob", "f", LockMode::Exclusive);
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1, "writers overlapped");
        assert_eq!(mgr.entry_count(), 0);
    }

    #[test]
    fn readers_share_and_writer_excludes() {
        let mgr = Arc::new(LockManager::new());
        let readers = Arc::new(AtomicUsize::new(0));

        let first = mgr.lock_file("bob", "f", LockMode::Shared);
        let reader = {
            let mgr = Arc::clone(&mgr);
            let readers = Arc::clone(&readers);
            thread::spawn(move || {
                let _g = mgr.lock_file("bob", "f", LockMode::Shared);
                readers.fetch_add(1, Ordering::SeqCst);
            })
        };
        reader.join().unwrap();
        // A second reader got in while the first guard was held.
        assert_eq!(readers.load(Ordering::SeqCst), 1);

        let writer_done = Arc::new(AtomicUsize::new(0));
        let writer = {
            let mgr = Arc::clone(&mgr);
            let writer_done = Arc::clone(&writer_done);
            thread::spawn(move || {
                let _g = mgr.lock_file("bob", "f", LockMode::Exclusive);
                writer_done.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(writer_done.load(Ordering::SeqCst), 0, "writer bypassed reader");
        drop(first);
        writer.join().unwrap();
        assert_eq!(writer_done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_files_do_not_serialize() {
        let mgr = Arc::new(LockManager::new());
        let _u = mgr.lock_file("carol", "u", LockMode::Exclusive);

        let other = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                // Must not block on the lock for a different file.
                let _v = mgr.lock_file("carol", "v", LockMode::Exclusive);
            })
        };
        other.join().unwrap();
    }

    #[test]
    fn user_and_file_locks_are_independent_keys() {
        let mgr = LockManager::new();
        let _user = mgr.lock_user("dave", LockMode::Exclusive);
        // File lock under the same user is a different entry; acquiring it
        // on the same thread must not deadlock.
        let _file = mgr.lock_file("dave", "f", LockMode::Exclusive);
        assert_eq!(mgr.entry_count(), 2);
    }
}
