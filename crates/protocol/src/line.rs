//! LF-terminated line framing over a buffered reader.
//!
//! Payload bytes (upload/download bodies) are read through the same reader
//! via its [`Read`] impl, so framing and raw transfer stay in sync on one
//! buffer.

use std::io::{self, BufRead, BufReader, Read};

use memchr::memchr;
use thiserror::Error;

/// Maximum accepted length of a single command or reply line, terminator
/// included.
pub const MAX_LINE_LEN: usize = 1024;

/// Why a line could not be produced.
#[derive(Debug, Error)]
pub enum LineError {
    /// Underlying transport failure; the connection is unusable.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The line exceeded [`MAX_LINE_LEN`]. The excess was consumed through
    /// the next LF, so the stream is still framed.
    #[error("line exceeds {MAX_LINE_LEN} bytes")]
    TooLong,
    /// The line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    NotUtf8,
}

/// Buffered reader producing protocol lines with CR tolerance.
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: Read> LineReader<R> {
    /// Wraps `inner` with a default-capacity buffer.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Reads the next line, stripping the LF terminator and one optional
    /// preceding CR. Returns `Ok(None)` on a clean EOF at a line boundary;
    /// EOF in the middle of a line yields the partial line.
    pub fn read_line(&mut self) -> Result<Option<String>, LineError> {
        let mut line: Vec<u8> = Vec::new();
        let mut overlong = false;

        loop {
            let available = self.inner.fill_buf()?;
            if available.is_empty() {
                // EOF: a partial line is delivered, a boundary EOF is None.
                if line.is_empty() && !overlong {
                    return Ok(None);
                }
                break;
            }

            match memchr(b'\n', available) {
                Some(at) => {
                    if !overlong {
                        line.extend_from_slice(&available[..at]);
                    }
                    self.inner.consume(at + 1);
                    break;
                }
                None => {
                    if !overlong {
                        line.extend_from_slice(available);
                    }
                    let len = available.len();
                    self.inner.consume(len);
                    if line.len() > MAX_LINE_LEN {
                        // Keep draining until the terminator so the caller
                        // can answer PROTO and stay on the stream.
                        overlong = true;
                        line.clear();
                    }
                }
            }
        }

        if overlong || line.len() > MAX_LINE_LEN {
            return Err(LineError::TooLong);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| LineError::NotUtf8)
    }
}

impl<R: Read> Read for LineReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
