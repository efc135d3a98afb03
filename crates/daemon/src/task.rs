//! Tasks handed from connection handlers to workers.
//!
//! A task couples its parameters with a completion cell. The submitting
//! handler blocks on [`TaskHandle::wait`]; the worker splits the task into
//! its spec and a [`Responder`] and posts exactly one result. The result is
//! posted unconditionally — if the worker path unwinds before sending, the
//! responder's drop posts an I/O failure so the waiter can never hang.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use protocol::ErrorCode;
use tempfile::TempPath;

/// What a worker is asked to do.
pub(crate) enum TaskAction {
    /// Move an ingested temp file into place and commit its metadata.
    ///
    /// The temp path is owned by the task; any failure path that drops it
    /// unlinks the file.
    Upload { tmp: TempPath, declared_size: u64 },
    /// Resolve a file for streaming.
    Download,
    /// Remove a file and its metadata row.
    Delete,
    /// Enumerate the user's files.
    List,
}

/// Parameters of one task.
pub(crate) struct TaskSpec {
    pub user_id: i64,
    pub username: String,
    /// Present for everything but LIST.
    pub filename: Option<String>,
    pub action: TaskAction,
}

/// Successful task payloads.
#[derive(Debug)]
pub(crate) enum TaskOutput {
    /// UPLOAD/DELETE: nothing beyond `OK`.
    Done,
    /// DOWNLOAD: where the file lives and its recorded size.
    Download { path: PathBuf, size: u64 },
    /// LIST: names ascending.
    Listing(Vec<String>),
}

pub(crate) type TaskResult = Result<TaskOutput, ErrorCode>;

struct Completion {
    slot: Mutex<Option<TaskResult>>,
    done: Condvar,
}

/// A queued unit of work.
pub(crate) struct Task {
    spec: TaskSpec,
    completion: Arc<Completion>,
}

/// Waiter side of a task's completion cell.
pub(crate) struct TaskHandle {
    completion: Arc<Completion>,
}

/// Worker side of a task's completion cell.
pub(crate) struct Responder {
    completion: Option<Arc<Completion>>,
}

impl Task {
    /// Builds a task and the handle its submitter will block on.
    pub(crate) fn new(spec: TaskSpec) -> (Self, TaskHandle) {
        let completion = Arc::new(Completion {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        (
            Self {
                spec,
                completion: Arc::clone(&completion),
            },
            TaskHandle { completion },
        )
    }

    /// Splits the task into its parameters and the responder that must be
    /// used to post the result.
    pub(crate) fn into_parts(self) -> (TaskSpec, Responder) {
        (
            self.spec,
            Responder {
                completion: Some(self.completion),
            },
        )
    }
}

impl TaskHandle {
    /// Blocks until the worker posts the result.
    pub(crate) fn wait(self) -> TaskResult {
        let mut slot = self.completion.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.completion.done.wait(&mut slot);
        }
    }
}

impl Responder {
    /// Posts the result and wakes the waiter.
    pub(crate) fn send(mut self, result: TaskResult) {
        if let Some(completion) = self.completion.take() {
            post(&completion, result);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            post(&completion, Err(ErrorCode::Io));
        }
    }
}

fn post(completion: &Completion, result: TaskResult) {
    let mut slot = completion.slot.lock();
    *slot = Some(result);
    completion.done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn list_spec() -> TaskSpec {
        TaskSpec {
            user_id: 1,
            username: "alice".into(),
            filename: None,
            action: TaskAction::List,
        }
    }

    #[test]
    fn wait_receives_the_posted_result() {
        let (task, handle) = Task::new(list_spec());
        let worker = thread::spawn(move || {
            let (_spec, responder) = task.into_parts();
            responder.send(Ok(TaskOutput::Done));
        });
        assert!(matches!(handle.wait(), Ok(TaskOutput::Done)));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_responder_posts_io_failure() {
        let (task, handle) = Task::new(list_spec());
        drop(task.into_parts());
        assert!(matches!(handle.wait(), Err(ErrorCode::Io)));
    }

    #[test]
    fn result_survives_waiter_arriving_late() {
        let (task, handle) = Task::new(list_spec());
        let (_spec, responder) = task.into_parts();
        responder.send(Err(ErrorCode::NoFile));
        assert!(matches!(handle.wait(), Err(ErrorCode::NoFile)));
    }
}
