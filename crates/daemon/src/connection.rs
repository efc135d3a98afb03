//! Connection stage: one handler, one client, one command at a time.
//!
//! A handler owns the connection for the whole session: it parses command
//! lines, gates on authentication, ingests upload payloads into fsynced
//! temp files, submits one task at a time to the worker stage and blocks on
//! its completion, then formats the reply. There is no pipelining on a
//! connection — the next line is not read until the previous task finished.
//!
//! Download payloads are streamed here, outside any lock: the worker only
//! resolves the path, and the open handle pins the inode even if a
//! concurrent upload renames a new file over the name.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;

use metadata::{Store, StoreError};
use protocol::{Command, ErrorCode, LineError, LineReader, Reply, UPLOAD_TMP_PREFIX};
use tracing::{debug, warn};

use crate::auth::{hash_password, verify_password};
use crate::queue::Queue;
use crate::session::{AuthedUser, Session};
use crate::storage::ensure_user_dir;
use crate::task::{Task, TaskAction, TaskOutput, TaskSpec};

/// Shared context for the connection-handler pool.
pub(crate) struct ConnectionCtx {
    pub store: Arc<Store>,
    pub tasks: Arc<Queue<Task>>,
    pub root: PathBuf,
    pub default_quota: u64,
}

/// Services one client connection until EOF, a fatal I/O error, or
/// shutdown.
pub(crate) fn serve(ctx: &ConnectionCtx, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());

    let Ok(read_half) = stream.try_clone() else {
        warn!(%peer, "failed to clone connection for reading");
        return;
    };
    let mut reader = LineReader::new(read_half);
    let mut writer = stream;
    let mut session = Session::new();

    debug!(%peer, "session started");

    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(LineError::TooLong | LineError::NotUtf8) => {
                // The reader consumed through the terminator; the stream is
                // still framed and the session survives.
                if reply(&mut writer, &Reply::Err(ErrorCode::Proto)).is_err() {
                    break;
                }
                continue;
            }
            Err(LineError::Io(err)) => {
                debug!(%peer, %err, "read failed");
                break;
            }
        };

        let command = match protocol::command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                if reply(&mut writer, &Reply::Err(err.code())).is_err() {
                    break;
                }
                continue;
            }
        };

        let outcome = match command {
            Command::Signup { user, pass } => signup(ctx, &mut writer, &user, &pass),
            Command::Login { user, pass } => login(ctx, &mut writer, &mut session, &user, &pass),
            authed => {
                let Some(user) = session.user().cloned() else {
                    // Keep the stream framed: a rejected upload still has
                    // its payload on the wire.
                    if let Command::Upload { size, .. } = &authed {
                        if discard(&mut reader, *size).is_err() {
                            break;
                        }
                    }
                    match reply(&mut writer, &Reply::Err(ErrorCode::Auth)) {
                        Ok(()) => continue,
                        Err(_) => break,
                    }
                };
                match authed {
                    Command::Upload { name, size } => {
                        upload(ctx, &mut reader, &mut writer, &user, name, size)
                    }
                    Command::Download { name } => {
                        download(ctx, &mut writer, &user, name)
                    }
                    Command::Delete { name } => delete(ctx, &mut writer, &user, name),
                    Command::List => list(ctx, &mut writer, &user),
                    Command::Signup { .. } | Command::Login { .. } => unreachable!(),
                }
            }
        };

        if outcome.is_err() {
            break;
        }
    }

    debug!(%peer, "session ended");
}

fn reply(writer: &mut TcpStream, reply: &Reply) -> io::Result<()> {
    writer.write_all(reply.encode().as_bytes())
}

fn signup(ctx: &ConnectionCtx, writer: &mut TcpStream, user: &str, pass: &str) -> io::Result<()> {
    let Ok(pass_hash) = hash_password(pass) else {
        return reply(writer, &Reply::Err(ErrorCode::Db));
    };
    match ctx.store.signup(user, &pass_hash, ctx.default_quota) {
        Ok(_) => {
            debug!(user, "account created");
            reply(writer, &Reply::Ok)
        }
        Err(StoreError::UsernameTaken) => reply(writer, &Reply::Err(ErrorCode::Exists)),
        Err(err) => {
            warn!(user, %err, "signup failed");
            reply(writer, &Reply::Err(ErrorCode::Db))
        }
    }
}

fn login(
    ctx: &ConnectionCtx,
    writer: &mut TcpStream,
    session: &mut Session,
    user: &str,
    pass: &str,
) -> io::Result<()> {
    let record = match ctx.store.get_user(user) {
        Ok(Some(record)) => record,
        Ok(None) => return reply(writer, &Reply::Err(ErrorCode::Auth)),
        Err(err) => {
            warn!(user, %err, "login lookup failed");
            return reply(writer, &Reply::Err(ErrorCode::Db));
        }
    };
    if !verify_password(pass, &record.pass_hash) {
        return reply(writer, &Reply::Err(ErrorCode::Auth));
    }
    session.authenticate(record.id, record.username);
    debug!(user, "login ok");
    reply(writer, &Reply::Ok)
}

/// Ingests the payload into a temp file and hands it to the worker stage.
///
/// A short read or disk failure here is session-fatal: the stream is no
/// longer framed, so the error reply (if it can be sent at all) is the
/// last thing this connection sees.
fn upload(
    ctx: &ConnectionCtx,
    reader: &mut LineReader<TcpStream>,
    writer: &mut TcpStream,
    user: &AuthedUser,
    name: String,
    size: u64,
) -> io::Result<()> {
    let tmp = match ingest(ctx, reader, user, size) {
        Ok(tmp) => tmp,
        Err(err) => {
            debug!(user = %user.username, file = %name, %err, "upload ingest failed");
            let _ = reply(writer, &Reply::Err(ErrorCode::Io));
            return Err(err);
        }
    };

    let result = submit(
        ctx,
        user,
        Some(name),
        TaskAction::Upload {
            tmp,
            declared_size: size,
        },
    )?;
    match result {
        Ok(_) => reply(writer, &Reply::Ok),
        Err(code) => reply(writer, &Reply::Err(code)),
    }
}

fn ingest(
    ctx: &ConnectionCtx,
    reader: &mut LineReader<TcpStream>,
    user: &AuthedUser,
    size: u64,
) -> io::Result<tempfile::TempPath> {
    let dir = ensure_user_dir(&ctx.root, &user.username)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(UPLOAD_TMP_PREFIX)
        .tempfile_in(dir)?;

    let copied = io::copy(&mut reader.by_ref().take(size), tmp.as_file_mut())?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-payload",
        ));
    }
    tmp.as_file().sync_all()?;
    Ok(tmp.into_temp_path())
}

fn download(
    ctx: &ConnectionCtx,
    writer: &mut TcpStream,
    user: &AuthedUser,
    name: String,
) -> io::Result<()> {
    let result = submit(ctx, user, Some(name), TaskAction::Download)?;
    let (path, _size) = match result {
        Ok(TaskOutput::Download { path, size }) => (path, size),
        Ok(_) => return reply(writer, &Reply::Err(ErrorCode::Io)),
        Err(code) => return reply(writer, &Reply::Err(code)),
    };

    // The lock is gone; the open handle is what pins the bytes we announce.
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %path.display(), %err, "open for streaming failed");
            return reply(writer, &Reply::Err(ErrorCode::Io));
        }
    };
    let len = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(_) => return reply(writer, &Reply::Err(ErrorCode::Io)),
    };

    reply(writer, &Reply::OkCount(len))?;
    let mut remaining = file.take(len);
    io::copy(&mut remaining, writer)?;
    Ok(())
}

fn delete(
    ctx: &ConnectionCtx,
    writer: &mut TcpStream,
    user: &AuthedUser,
    name: String,
) -> io::Result<()> {
    let result = submit(ctx, user, Some(name), TaskAction::Delete)?;
    match result {
        Ok(_) => reply(writer, &Reply::Ok),
        Err(code) => reply(writer, &Reply::Err(code)),
    }
}

fn list(ctx: &ConnectionCtx, writer: &mut TcpStream, user: &AuthedUser) -> io::Result<()> {
    let result = submit(ctx, user, None, TaskAction::List)?;
    match result {
        Ok(TaskOutput::Listing(names)) => {
            let mut body = Reply::OkCount(names.len() as u64).encode();
            for name in &names {
                body.push_str(name);
                body.push('\n');
            }
            writer.write_all(body.as_bytes())
        }
        Ok(_) => reply(writer, &Reply::Err(ErrorCode::Io)),
        Err(code) => reply(writer, &Reply::Err(code)),
    }
}

/// Pushes a task and blocks on its completion.
///
/// Fails (ending the session) only when the task queue is closed, which
/// means the server is shutting down.
fn submit(
    ctx: &ConnectionCtx,
    user: &AuthedUser,
    filename: Option<String>,
    action: TaskAction,
) -> io::Result<crate::task::TaskResult> {
    let (task, handle) = Task::new(TaskSpec {
        user_id: user.user_id,
        username: user.username.clone(),
        filename,
        action,
    });
    if ctx.tasks.push(task).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "task queue closed",
        ));
    }
    Ok(handle.wait())
}

/// Reads and discards `size` payload bytes after a rejected upload.
fn discard(reader: &mut LineReader<TcpStream>, size: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.by_ref().take(size), &mut io::sink())?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-payload",
        ));
    }
    Ok(())
}
