//! Wire grammar shared by the depot daemon and client.
//!
//! The protocol is line-oriented ASCII: each request is a single
//! LF-terminated command line (a trailing CR is tolerated), optionally
//! followed by a length-prefixed raw payload. Replies are a single `OK`
//! or `ERR <code>` line, optionally carrying a decimal size/count and a
//! payload of exactly that many bytes.
//!
//! This crate owns parsing and encoding only; it performs no I/O beyond
//! the buffered [`line::LineReader`].

pub mod command;
pub mod line;
pub mod reply;

pub use command::{Command, CommandError, validate_filename, validate_username};
pub use line::{LineError, LineReader, MAX_LINE_LEN};
pub use reply::{ErrorCode, Reply, ReplyParseError};

/// Maximum length in bytes of a username or password token.
pub const MAX_CREDENTIAL_LEN: usize = 127;

/// Maximum length in bytes of a stored file name.
pub const MAX_NAME_LEN: usize = 255;

/// Prefix reserved for in-flight upload temp files inside a user directory.
///
/// Names carrying this prefix are rejected at parse time so client files can
/// never collide with ingest temps or survive the startup temp sweep.
pub const UPLOAD_TMP_PREFIX: &str = ".tmp.upload.";
