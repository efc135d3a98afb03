//! Worker stage: executes tasks under the lock hierarchy.
//!
//! Each worker drains the task queue and dispatches on the task kind.
//! Mutating operations commit metadata first and touch the filesystem
//! second: an upload's rename failure is compensated by reverting the
//! metadata write, and the remaining crash window (commit, then death
//! before rename) is repaired by the startup scrub.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use metadata::{Store, StoreError, Upsert};
use protocol::ErrorCode;
use tempfile::TempPath;
use tracing::{debug, error, warn};

use crate::locks::{LockManager, LockMode};
use crate::queue::Queue;
use crate::storage::{ensure_user_dir, resolve_file};
use crate::task::{Task, TaskAction, TaskOutput, TaskResult, TaskSpec};

/// Shared context for the worker pool.
pub(crate) struct WorkerCtx {
    pub store: Arc<Store>,
    pub locks: Arc<LockManager>,
    pub root: PathBuf,
}

/// Drains `tasks` until the queue is closed and empty.
pub(crate) fn run(ctx: &WorkerCtx, tasks: &Queue<Task>) {
    while let Some(task) = tasks.pop() {
        let (spec, responder) = task.into_parts();
        responder.send(execute(ctx, spec));
    }
}

fn execute(ctx: &WorkerCtx, spec: TaskSpec) -> TaskResult {
    let TaskSpec {
        user_id,
        username,
        filename,
        action,
    } = spec;

    match action {
        TaskAction::Upload { tmp, declared_size } => {
            let name = filename.ok_or(ErrorCode::Proto)?;
            upload(ctx, user_id, &username, &name, tmp, declared_size)
        }
        TaskAction::Download => {
            let name = filename.ok_or(ErrorCode::Proto)?;
            download(ctx, &username, &name)
        }
        TaskAction::Delete => {
            let name = filename.ok_or(ErrorCode::Proto)?;
            delete(ctx, user_id, &username, &name)
        }
        TaskAction::List => list(ctx, user_id, &username),
    }
}

/// UPLOAD: user-write, file-write, metadata upsert (quota inside the
/// transaction), then atomic rename into place.
fn upload(
    ctx: &WorkerCtx,
    user_id: i64,
    username: &str,
    name: &str,
    tmp: TempPath,
    declared_size: u64,
) -> TaskResult {
    let _user = ctx.locks.lock_user(username, LockMode::Exclusive);
    let _file = ctx.locks.lock_file(username, name, LockMode::Exclusive);

    let final_path = resolve_file(&ctx.root, username, name).ok_or(ErrorCode::Proto)?;
    if ensure_user_dir(&ctx.root, username).is_err() {
        return Err(ErrorCode::Io);
    }

    let upsert = match ctx.store.upsert_file(user_id, name, declared_size) {
        Ok(upsert) => upsert,
        Err(StoreError::QuotaExceeded) => {
            debug!(user = username, file = name, "upload rejected by quota");
            return Err(ErrorCode::Quota);
        }
        Err(err) => {
            warn!(user = username, file = name, %err, "metadata upsert failed");
            return Err(ErrorCode::Db);
        }
    };

    if let Err(persist_err) = tmp.persist(&final_path) {
        warn!(
            user = username,
            file = name,
            error = %persist_err.error,
            "rename into place failed after metadata commit; reverting"
        );
        revert_upsert(ctx, user_id, username, name, upsert);
        // persist_err still owns the temp path; dropping it unlinks the file.
        return Err(ErrorCode::Move);
    }

    Ok(TaskOutput::Done)
}

/// Compensation for a failed rename: put the metadata back the way it was.
/// If this fails too, the store and the filesystem disagree until the next
/// startup scrub.
fn revert_upsert(ctx: &WorkerCtx, user_id: i64, username: &str, name: &str, upsert: Upsert) {
    let reverted = match upsert.old_size {
        Some(old_size) => ctx.store.upsert_file(user_id, name, old_size).map(|_| ()),
        None => ctx.store.delete_file(user_id, name).map(|_| ()),
    };
    if let Err(err) = reverted {
        error!(
            user = username,
            file = name,
            %err,
            "failed to revert metadata after rename failure; scrub will reconcile"
        );
    }
}

/// DOWNLOAD: file-read only. The result carries the resolved path; the
/// connection handler opens and streams it outside the lock.
fn download(ctx: &WorkerCtx, username: &str, name: &str) -> TaskResult {
    let _file = ctx.locks.lock_file(username, name, LockMode::Shared);

    let path = resolve_file(&ctx.root, username, name).ok_or(ErrorCode::Proto)?;
    match fs::metadata(&path) {
        Ok(meta) if meta.is_file() => Ok(TaskOutput::Download {
            size: meta.len(),
            path,
        }),
        Ok(_) => Err(ErrorCode::NoFile),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ErrorCode::NoFile),
        Err(err) => {
            warn!(user = username, file = name, %err, "stat failed");
            Err(ErrorCode::Io)
        }
    }
}

/// DELETE: user-write, file-write, metadata delete, then unlink. A missing
/// disk file is tolerated — the row is gone and accounting is already
/// consistent.
fn delete(ctx: &WorkerCtx, user_id: i64, username: &str, name: &str) -> TaskResult {
    let _user = ctx.locks.lock_user(username, LockMode::Exclusive);
    let _file = ctx.locks.lock_file(username, name, LockMode::Exclusive);

    let path = resolve_file(&ctx.root, username, name).ok_or(ErrorCode::Proto)?;
    match ctx.store.delete_file(user_id, name) {
        Ok(Some(_old_size)) => {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(user = username, file = name, %err, "unlink failed; file is now orphaned");
                }
            }
            Ok(TaskOutput::Done)
        }
        Ok(None) => Err(ErrorCode::NoFile),
        Err(err) => {
            warn!(user = username, file = name, %err, "metadata delete failed");
            Err(ErrorCode::Db)
        }
    }
}

/// LIST: user-read; compatible with concurrent downloads, serialized
/// against the user's own uploads and deletes.
fn list(ctx: &WorkerCtx, user_id: i64, username: &str) -> TaskResult {
    let _user = ctx.locks.lock_user(username, LockMode::Shared);

    match ctx.store.list_files(user_id) {
        Ok(names) => Ok(TaskOutput::Listing(names)),
        Err(err) => {
            warn!(user = username, %err, "metadata listing failed");
            Err(ErrorCode::Db)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> (WorkerCtx, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = WorkerCtx {
            store: Arc::new(Store::open_in_memory().unwrap()),
            locks: Arc::new(LockManager::new()),
            root: dir.path().to_path_buf(),
        };
        (ctx, dir)
    }

    fn ingest(ctx: &WorkerCtx, username: &str, payload: &[u8]) -> TempPath {
        let dir = ensure_user_dir(&ctx.root, username).unwrap();
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp.upload.")
            .tempfile_in(dir)
            .unwrap();
        tmp.write_all(payload).unwrap();
        tmp.into_temp_path()
    }

    #[test]
    fn upload_places_file_and_commits_metadata() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        let tmp = ingest(&ctx, "alice", b"hello");

        let result = upload(&ctx, uid, "alice", "a.txt", tmp, 5);
        assert!(matches!(result, Ok(TaskOutput::Done)));
        assert_eq!(fs::read(ctx.root.join("alice/a.txt")).unwrap(), b"hello");
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 5);
    }

    #[test]
    fn quota_rejection_removes_the_temp_file() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 3).unwrap();
        let tmp = ingest(&ctx, "alice", b"hello");
        let tmp_path = tmp.to_path_buf();

        let result = upload(&ctx, uid, "alice", "a.txt", tmp, 5);
        assert!(matches!(result, Err(ErrorCode::Quota)));
        assert!(!tmp_path.exists());
        assert!(!ctx.root.join("alice/a.txt").exists());
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 0);
    }

    #[test]
    fn upload_with_invalid_name_is_rejected_after_ingest() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        let tmp = ingest(&ctx, "alice", b"hello");
        let tmp_path = tmp.to_path_buf();

        // Names pass the parser unchecked so the payload stays framed; the
        // rejection happens here.
        let result = upload(&ctx, uid, "alice", "..", tmp, 5);
        assert!(matches!(result, Err(ErrorCode::Proto)));
        assert!(!tmp_path.exists());
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 0);
    }

    #[test]
    fn overwrite_accounts_the_difference() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();

        let first = ingest(&ctx, "alice", b"aaaa");
        assert!(upload(&ctx, uid, "alice", "f", first, 4).is_ok());
        let second = ingest(&ctx, "alice", b"bb");
        assert!(upload(&ctx, uid, "alice", "f", second, 2).is_ok());

        assert_eq!(fs::read(ctx.root.join("alice/f")).unwrap(), b"bb");
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 2);
        assert_eq!(ctx.store.list_files(uid).unwrap().len(), 1);
    }

    #[test]
    fn download_reports_path_and_size() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        let tmp = ingest(&ctx, "alice", b"hello");
        upload(&ctx, uid, "alice", "a.txt", tmp, 5).unwrap();

        match download(&ctx, "alice", "a.txt") {
            Ok(TaskOutput::Download { path, size }) => {
                assert_eq!(size, 5);
                assert_eq!(path, ctx.root.join("alice/a.txt"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn download_of_absent_file_is_nofile() {
        let (ctx, _dir) = ctx();
        assert!(matches!(
            download(&ctx, "alice", "ghost"),
            Err(ErrorCode::NoFile)
        ));
    }

    #[test]
    fn delete_twice_reports_nofile_second_time() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        let tmp = ingest(&ctx, "alice", b"hello");
        upload(&ctx, uid, "alice", "a.txt", tmp, 5).unwrap();

        assert!(matches!(
            delete(&ctx, uid, "alice", "a.txt"),
            Ok(TaskOutput::Done)
        ));
        assert!(!ctx.root.join("alice/a.txt").exists());
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 0);
        assert!(matches!(
            delete(&ctx, uid, "alice", "a.txt"),
            Err(ErrorCode::NoFile)
        ));
    }

    #[test]
    fn delete_with_missing_disk_file_still_succeeds() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        ctx.store.upsert_file(uid, "phantom", 7).unwrap();

        assert!(matches!(
            delete(&ctx, uid, "alice", "phantom"),
            Ok(TaskOutput::Done)
        ));
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 0);
    }

    #[test]
    fn list_returns_names_ascending() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 100).unwrap();
        for name in ["b", "a"] {
            let tmp = ingest(&ctx, "alice", b"x");
            upload(&ctx, uid, "alice", name, tmp, 1).unwrap();
        }
        match list(&ctx, uid, "alice") {
            Ok(TaskOutput::Listing(names)) => {
                assert_eq!(names, vec!["a".to_owned(), "b".to_owned()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn zero_byte_upload_is_valid_and_free() {
        let (ctx, _dir) = ctx();
        let uid = ctx.store.signup("alice", "h", 10).unwrap();
        let tmp = ingest(&ctx, "alice", b"");

        assert!(upload(&ctx, uid, "alice", "empty", tmp, 0).is_ok());
        assert_eq!(fs::read(ctx.root.join("alice/empty")).unwrap(), b"");
        assert_eq!(ctx.store.get_user("alice").unwrap().unwrap().used_bytes, 0);
    }
}
