//! Startup reconciliation between the metadata store and the filesystem.
//!
//! Uploads commit metadata before renaming the temp file into place, so a
//! crash in between leaves a row whose file does not exist. The scrub runs
//! before the listener opens: it drops such rows, recomputes every user's
//! `used_bytes` from the surviving rows, and sweeps ingest temp files left
//! behind by crashes mid-upload.

use std::fs;
use std::path::Path;

use metadata::{Store, StoreError};
use protocol::UPLOAD_TMP_PREFIX;
use tracing::{debug, info, warn};

use crate::storage::{resolve_file, user_dir};

/// What a scrub pass found and fixed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScrubReport {
    /// Users examined.
    pub users: u64,
    /// File rows dropped because no file backed them.
    pub dangling_rows: u64,
    /// Leftover `.tmp.upload.*` files removed.
    pub stale_temps: u64,
}

/// Runs one scrub pass over every user.
pub fn run(store: &Store, root: &Path) -> Result<ScrubReport, StoreError> {
    let mut report = ScrubReport::default();

    for user in store.users()? {
        report.users += 1;

        for row in store.files(user.id)? {
            let backed = resolve_file(root, &user.username, &row.name)
                .is_some_and(|path| path.is_file());
            if !backed {
                debug!(
                    user = %user.username,
                    file = %row.name,
                    size = row.size,
                    "dropping dangling metadata row"
                );
                store.delete_file(user.id, &row.name)?;
                report.dangling_rows += 1;
            }
        }

        // Make the sum authoritative regardless of what was dropped above.
        store.recompute_used(user.id)?;

        report.stale_temps += sweep_temps(&user_dir(root, &user.username));
    }

    info!(
        users = report.users,
        dangling_rows = report.dangling_rows,
        stale_temps = report.stale_temps,
        "startup scrub complete"
    );
    Ok(report)
}

/// Removes leftover ingest temps in one user directory. Best-effort; a
/// missing directory just means the user never uploaded.
fn sweep_temps(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_temp = name
            .to_str()
            .is_some_and(|name| name.starts_with(UPLOAD_TMP_PREFIX));
        if is_temp {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "failed to remove stale temp");
                }
            }
        }
    }
    removed
}
