//! Request-line parsing.
//!
//! A command line is a verb followed by whitespace-separated tokens. The
//! verb set is closed; anything else is `UNKNOWN`. Malformed arguments for
//! a recognized verb are `PROTO`, and both leave the session usable.

use thiserror::Error;

use crate::reply::ErrorCode;
use crate::{MAX_CREDENTIAL_LEN, MAX_NAME_LEN, UPLOAD_TMP_PREFIX};

/// A fully parsed client request line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `SIGNUP <user> <pass>` — create an account.
    Signup { user: String, pass: String },
    /// `LOGIN <user> <pass>` — authenticate this connection.
    Login { user: String, pass: String },
    /// `UPLOAD <name> <size>` — exactly `size` payload bytes follow.
    ///
    /// The name is carried as-is: its rules are enforced by the executing
    /// side, after the payload has been read, so a rejection can never
    /// leave half a payload sitting on the stream.
    Upload { name: String, size: u64 },
    /// `DOWNLOAD <name>` — request the file's bytes.
    Download { name: String },
    /// `DELETE <name>` — remove the file.
    Delete { name: String },
    /// `LIST` — enumerate this user's files.
    List,
}

impl Command {
    /// Returns whether the command may be issued without a logged-in session.
    #[must_use]
    pub const fn allowed_unauthenticated(&self) -> bool {
        matches!(self, Self::Signup { .. } | Self::Login { .. })
    }
}

/// Why a request line failed to parse.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// The line contained no verb at all.
    #[error("empty command line")]
    Empty,
    /// The verb is not part of the protocol.
    #[error("unrecognized command {0:?}")]
    Unrecognized(String),
    /// The verb is known but its arguments do not match the grammar.
    #[error("malformed arguments for {0}")]
    BadArguments(&'static str),
    /// A username or password token violates the credential rules.
    #[error("invalid credential token")]
    BadCredential,
    /// A file name token violates the naming rules.
    #[error("invalid file name")]
    BadName,
}

impl CommandError {
    /// The wire error code this parse failure maps to.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unrecognized(_) => ErrorCode::Unknown,
            _ => ErrorCode::Proto,
        }
    }
}

/// Parses one request line (without its terminator).
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let mut tokens = line.split_ascii_whitespace();
    let verb = tokens.next().ok_or(CommandError::Empty)?;

    let command = match verb {
        "SIGNUP" => {
            let (user, pass) = credential_pair(&mut tokens, "SIGNUP")?;
            Command::Signup { user, pass }
        }
        "LOGIN" => {
            let (user, pass) = credential_pair(&mut tokens, "LOGIN")?;
            Command::Login { user, pass }
        }
        "UPLOAD" => {
            // The payload follows this line no matter what the name looks
            // like; name rules are enforced after ingest so the stream
            // stays framed.
            let name = tokens
                .next()
                .ok_or(CommandError::BadArguments("UPLOAD"))?
                .to_owned();
            let size = tokens
                .next()
                .and_then(|t| t.parse::<u64>().ok())
                .ok_or(CommandError::BadArguments("UPLOAD"))?;
            expect_end(&mut tokens, "UPLOAD")?;
            Command::Upload { name, size }
        }
        "DOWNLOAD" => {
            let name = name_token(tokens.next(), "DOWNLOAD")?;
            expect_end(&mut tokens, "DOWNLOAD")?;
            Command::Download { name }
        }
        "DELETE" => {
            let name = name_token(tokens.next(), "DELETE")?;
            expect_end(&mut tokens, "DELETE")?;
            Command::Delete { name }
        }
        "LIST" => {
            expect_end(&mut tokens, "LIST")?;
            Command::List
        }
        other => return Err(CommandError::Unrecognized(other.to_owned())),
    };

    Ok(command)
}

fn credential_pair<'a, I>(
    tokens: &mut I,
    verb: &'static str,
) -> Result<(String, String), CommandError>
where
    I: Iterator<Item = &'a str>,
{
    let user = tokens.next().ok_or(CommandError::BadArguments(verb))?;
    let pass = tokens.next().ok_or(CommandError::BadArguments(verb))?;
    expect_end(tokens, verb)?;
    if !validate_username(user) || pass.is_empty() || pass.len() > MAX_CREDENTIAL_LEN {
        return Err(CommandError::BadCredential);
    }
    Ok((user.to_owned(), pass.to_owned()))
}

fn name_token(token: Option<&str>, verb: &'static str) -> Result<String, CommandError> {
    let name = token.ok_or(CommandError::BadArguments(verb))?;
    if validate_filename(name) {
        Ok(name.to_owned())
    } else {
        Err(CommandError::BadName)
    }
}

fn expect_end<'a, I>(tokens: &mut I, verb: &'static str) -> Result<(), CommandError>
where
    I: Iterator<Item = &'a str>,
{
    if tokens.next().is_some() {
        Err(CommandError::BadArguments(verb))
    } else {
        Ok(())
    }
}

/// Returns whether `user` is acceptable as an account name.
///
/// Usernames double as directory names under the storage root, so the rules
/// are the file-name rules with the tighter credential length cap.
#[must_use]
pub fn validate_username(user: &str) -> bool {
    !user.is_empty()
        && user.len() <= MAX_CREDENTIAL_LEN
        && user != "."
        && user != ".."
        && user.bytes().all(|b| b.is_ascii_graphic() && b != b'/')
}

/// Returns whether `name` is acceptable as a stored file name.
///
/// Rejects path separators, NUL, relative components, non-printable bytes,
/// over-long names, and the reserved ingest-temp prefix.
#[must_use]
pub fn validate_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && !name.starts_with(UPLOAD_TMP_PREFIX)
        && name
            .bytes()
            .all(|b| (b.is_ascii_graphic() && b != b'/') || b >= 0x80)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signup_and_login() {
        assert_eq!(
            parse("SIGNUP alice pw"),
            Ok(Command::Signup {
                user: "alice".into(),
                pass: "pw".into()
            })
        );
        assert_eq!(
            parse("LOGIN alice pw"),
            Ok(Command::Login {
                user: "alice".into(),
                pass: "pw".into()
            })
        );
    }

    #[test]
    fn parses_upload_with_size() {
        assert_eq!(
            parse("UPLOAD a.txt 5"),
            Ok(Command::Upload {
                name: "a.txt".into(),
                size: 5
            })
        );
    }

    #[test]
    fn parses_bare_list() {
        assert_eq!(parse("LIST"), Ok(Command::List));
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert_eq!(parse("LIST extra"), Err(CommandError::BadArguments("LIST")));
    }

    #[test]
    fn unknown_verb_maps_to_unknown_code() {
        let err = parse("LOGOUT alice").unwrap_err();
        assert_eq!(err, CommandError::Unrecognized("LOGOUT".into()));
        assert_eq!(err.code(), ErrorCode::Unknown);
    }

    #[test]
    fn empty_line_is_proto() {
        assert_eq!(parse("").unwrap_err().code(), ErrorCode::Proto);
        assert_eq!(parse("   ").unwrap_err().code(), ErrorCode::Proto);
    }

    #[test]
    fn upload_without_size_is_proto() {
        assert_eq!(
            parse("UPLOAD a.txt"),
            Err(CommandError::BadArguments("UPLOAD"))
        );
        assert_eq!(
            parse("UPLOAD a.txt -3"),
            Err(CommandError::BadArguments("UPLOAD"))
        );
    }

    #[test]
    fn traversal_names_are_rejected() {
        assert_eq!(parse("DELETE .."), Err(CommandError::BadName));
        assert_eq!(parse("DOWNLOAD a/b"), Err(CommandError::BadName));
        assert!(!validate_filename("."));
        assert!(!validate_filename("a/b"));
        assert!(!validate_filename(""));
    }

    #[test]
    fn upload_names_are_not_validated_at_parse_time() {
        // The executing side rejects them after the payload is consumed.
        assert_eq!(
            parse("UPLOAD .. 5"),
            Ok(Command::Upload {
                name: "..".into(),
                size: 5
            })
        );
        assert_eq!(
            parse("UPLOAD .tmp.upload.x 0"),
            Ok(Command::Upload {
                name: ".tmp.upload.x".into(),
                size: 0
            })
        );
    }

    #[test]
    fn reserved_temp_prefix_is_rejected() {
        assert!(!validate_filename(".tmp.upload.abc"));
        assert!(validate_filename(".tmp.uploads"));
    }

    #[test]
    fn name_length_cap_is_enforced() {
        let max = "x".repeat(MAX_NAME_LEN);
        assert!(validate_filename(&max));
        assert!(!validate_filename(&format!("{max}x")));
    }

    #[test]
    fn username_rules_are_tighter_than_names() {
        assert!(validate_username("alice"));
        assert!(!validate_username(".."));
        assert!(!validate_username("a/b"));
        assert!(!validate_username(&"u".repeat(MAX_CREDENTIAL_LEN + 1)));
    }

    #[test]
    fn signup_with_bad_username_is_proto() {
        assert_eq!(parse("SIGNUP .. pw"), Err(CommandError::BadCredential));
        assert_eq!(
            parse("SIGNUP .. pw").unwrap_err().code(),
            ErrorCode::Proto
        );
    }
}
