//! Protocol-level client session.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

use thiserror::Error;

use protocol::{ErrorCode, LineError, LineReader, Reply, ReplyParseError};

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or local file I/O failure; the session is over.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The server's reply did not match the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The server answered with an error code.
    #[error("server said {0}")]
    Server(ErrorCode),
}

impl From<ReplyParseError> for ClientError {
    fn from(err: ReplyParseError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// One authenticated (or not yet) connection to a depot server.
pub struct DepotClient {
    reader: LineReader<TcpStream>,
    writer: TcpStream,
}

impl DepotClient {
    /// Wraps a connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let reader = LineReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }

    /// `SIGNUP`; a success does not log the connection in.
    pub fn signup(&mut self, user: &str, pass: &str) -> Result<String, ClientError> {
        self.simple(&format!("SIGNUP {user} {pass}\n"))?;
        Ok("account created; log in to use it".to_owned())
    }

    /// `LOGIN`.
    pub fn login(&mut self, user: &str, pass: &str) -> Result<String, ClientError> {
        self.simple(&format!("LOGIN {user} {pass}\n"))?;
        Ok(format!("logged in as {user}"))
    }

    /// `UPLOAD` of a local file, named `name` on the server (basename of
    /// `local` when omitted).
    pub fn upload(&mut self, local: &str, name: Option<&str>) -> Result<String, ClientError> {
        let path = Path::new(local);
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = match name {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    ClientError::Protocol(format!("{local:?} has no usable file name"))
                })?,
        };

        self.writer
            .write_all(format!("UPLOAD {name} {size}\n").as_bytes())?;
        io::copy(&mut file, &mut self.writer)?;
        self.expect_ok()?;
        Ok(format!("stored {name} ({size} bytes)"))
    }

    /// `DOWNLOAD` into a local file (same name when omitted).
    pub fn download(&mut self, name: &str, local: Option<&str>) -> Result<String, ClientError> {
        self.writer
            .write_all(format!("DOWNLOAD {name}\n").as_bytes())?;
        let size = match self.read_reply()? {
            Reply::OkCount(size) => size,
            Reply::Ok => return Err(ClientError::Protocol("OK without a size".to_owned())),
            Reply::Err(code) => return Err(ClientError::Server(code)),
        };

        let local = local.unwrap_or(name);
        let mut file = File::create(local)?;
        let copied = io::copy(&mut (&mut self.reader).take(size), &mut file)?;
        if copied != size {
            return Err(ClientError::Protocol(format!(
                "server promised {size} bytes, sent {copied}"
            )));
        }
        Ok(format!("fetched {name} into {local} ({size} bytes)"))
    }

    /// `DELETE`.
    pub fn delete(&mut self, name: &str) -> Result<String, ClientError> {
        self.simple(&format!("DELETE {name}\n"))?;
        Ok(format!("deleted {name}"))
    }

    /// `LIST`.
    pub fn list(&mut self) -> Result<String, ClientError> {
        self.writer.write_all(b"LIST\n")?;
        let count = match self.read_reply()? {
            Reply::OkCount(count) => count,
            Reply::Ok => return Err(ClientError::Protocol("OK without a count".to_owned())),
            Reply::Err(code) => return Err(ClientError::Server(code)),
        };

        let mut names = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            match self.reader.read_line() {
                Ok(Some(name)) => names.push(name),
                Ok(None) => {
                    return Err(ClientError::Protocol(
                        "listing truncated by the server".to_owned(),
                    ));
                }
                Err(LineError::Io(err)) => return Err(err.into()),
                Err(err) => return Err(ClientError::Protocol(err.to_string())),
            }
        }
        if names.is_empty() {
            Ok("no files".to_owned())
        } else {
            Ok(names.join("\n"))
        }
    }

    /// Sends a command expecting a bare `OK`.
    fn simple(&mut self, line: &str) -> Result<(), ClientError> {
        self.writer.write_all(line.as_bytes())?;
        self.expect_ok()
    }

    fn expect_ok(&mut self) -> Result<(), ClientError> {
        match self.read_reply()? {
            Reply::Ok | Reply::OkCount(_) => Ok(()),
            Reply::Err(code) => Err(ClientError::Server(code)),
        }
    }

    fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let line = match self.reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
            Err(LineError::Io(err)) => return Err(err.into()),
            Err(err) => return Err(ClientError::Protocol(err.to_string())),
        };
        Ok(Reply::parse(&line)?)
    }
}
