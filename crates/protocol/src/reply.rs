//! Reply lines and the wire error taxonomy.

use std::fmt;

use thiserror::Error;

/// Error codes carried on `ERR <code>` reply lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Malformed command or arguments; the session stays usable.
    Proto,
    /// Missing or incorrect credentials.
    Auth,
    /// SIGNUP of a username that already exists.
    Exists,
    /// DOWNLOAD or DELETE of a file that is not there.
    NoFile,
    /// Socket or disk read/write failure.
    Io,
    /// Metadata store operation failure.
    Db,
    /// An upload would push the user past their byte quota.
    Quota,
    /// Rename into place failed after the metadata commit was reverted.
    Move,
    /// Unrecognized command verb.
    Unknown,
}

impl ErrorCode {
    /// Canonical wire token for this code.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Proto => "PROTO",
            Self::Auth => "AUTH",
            Self::Exists => "EXISTS",
            Self::NoFile => "NOFILE",
            Self::Io => "IO",
            Self::Db => "DB",
            Self::Quota => "QUOTA",
            Self::Move => "MOVE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Looks up a code by its wire token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PROTO" => Some(Self::Proto),
            "AUTH" => Some(Self::Auth),
            "EXISTS" => Some(Self::Exists),
            "NOFILE" => Some(Self::NoFile),
            "IO" => Some(Self::Io),
            "DB" => Some(Self::Db),
            "QUOTA" => Some(Self::Quota),
            "MOVE" => Some(Self::Move),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// One reply line, before any payload bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// Bare `OK`.
    Ok,
    /// `OK <n>` — a payload size (DOWNLOAD) or entry count (LIST) follows.
    OkCount(u64),
    /// `ERR <code>`.
    Err(ErrorCode),
}

impl Reply {
    /// Encodes the reply as a wire line including the terminating LF.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Ok => "OK\n".to_owned(),
            Self::OkCount(n) => format!("OK {n}\n"),
            Self::Err(code) => format!("ERR {}\n", code.token()),
        }
    }

    /// Parses a reply line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, ReplyParseError> {
        let mut tokens = line.split_ascii_whitespace();
        match tokens.next() {
            Some("OK") => match tokens.next() {
                None => Ok(Self::Ok),
                Some(n) => n
                    .parse::<u64>()
                    .map(Self::OkCount)
                    .map_err(|_| ReplyParseError::BadCount(n.to_owned())),
            },
            Some("ERR") => {
                let token = tokens.next().ok_or(ReplyParseError::MissingCode)?;
                ErrorCode::from_token(token)
                    .map(Self::Err)
                    .ok_or_else(|| ReplyParseError::BadCode(token.to_owned()))
            }
            _ => Err(ReplyParseError::BadStatus(line.to_owned())),
        }
    }
}

/// Why a reply line from the server could not be understood.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ReplyParseError {
    /// The line did not start with `OK` or `ERR`.
    #[error("unexpected reply line {0:?}")]
    BadStatus(String),
    /// The `OK` count was not a decimal non-negative integer.
    #[error("invalid reply count {0:?}")]
    BadCount(String),
    /// `ERR` without a code token.
    #[error("error reply without a code")]
    MissingCode,
    /// `ERR` with a code outside the taxonomy.
    #[error("unrecognized error code {0:?}")]
    BadCode(String),
}
