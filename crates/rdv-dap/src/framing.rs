//! DAP frame extraction and encoding.
//! - FrameBuffer: growing receive buffer, one complete payload at a time
//! - encode_frame: `Content-Length: N\r\n\r\n` + payload

use thiserror::Error;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Cap on buffered receive bytes before framing gives up.
pub const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

/// Framing failures. All of them poison the buffer: once a header
/// cannot be interpreted there is no way to find the next frame
/// boundary, so extraction is refused until [`FrameBuffer::reset`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header block carried no `Content-Length` field.
    #[error("frame header missing Content-Length")]
    MissingContentLength,

    /// `Content-Length` value was not a number.
    #[error("invalid Content-Length value '{0}'")]
    InvalidContentLength(String),

    /// Frame body was not valid UTF-8.
    #[error("frame body is not valid UTF-8")]
    InvalidBody,

    /// Receive buffer grew past [`MAX_BUFFERED_BYTES`].
    #[error("receive buffer exceeded {max} bytes")]
    BufferOverflow { max: usize },

    /// A previous error left the stream unparseable.
    #[error("framing previously failed; buffer must be reset")]
    Poisoned,
}

/// Accumulates raw bytes from the backend and slices out complete
/// `Content-Length` framed payloads. A frame is complete only once the
/// declared body length has been buffered past the header terminator;
/// everything after it is retained for the next extraction.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
    poisoned: bool,
    max_bytes: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_BUFFERED_BYTES)
    }

    #[must_use]
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            poisoned: false,
            max_bytes,
        }
    }

    /// Append bytes read from the wire.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is poisoned or the cap would be exceeded;
    /// the bytes are dropped in both cases.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.data.len() + bytes.len() > self.max_bytes {
            self.poisoned = true;
            return Err(FrameError::BufferOverflow {
                max: self.max_bytes,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Extract the next complete payload, if one is fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Callers drain
    /// the buffer by looping until `None`, which makes many messages
    /// in one read and one message across many reads decode the same.
    ///
    /// # Errors
    ///
    /// A header without a parseable `Content-Length`, or a non-UTF-8
    /// body, is fatal to the stream and poisons the buffer.
    pub fn next_payload(&mut self) -> Result<Option<String>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        let Some(header_end) = find_subsequence(&self.data, HEADER_TERMINATOR) else {
            return Ok(None);
        };

        let header = String::from_utf8_lossy(&self.data[..header_end]).into_owned();
        let content_length = match parse_content_length(&header) {
            Ok(length) => length,
            Err(err) => {
                self.poisoned = true;
                return Err(err);
            }
        };

        let body_start = header_end + HEADER_TERMINATOR.len();
        let body_end = body_start + content_length;
        if self.data.len() < body_end {
            return Ok(None);
        }

        let body = self.data[body_start..body_end].to_vec();
        self.data.drain(..body_end);
        match String::from_utf8(body) {
            Ok(payload) => Ok(Some(payload)),
            Err(_) => {
                self.poisoned = true;
                Err(FrameError::InvalidBody)
            }
        }
    }

    /// Discard buffered bytes and clear the poisoned flag.
    pub fn reset(&mut self) {
        self.data.clear();
        self.poisoned = false;
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.data.len()
    }
}

/// Frame a payload for the wire.
#[must_use]
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(payload.as_bytes());
    frame
}

fn parse_content_length(header: &str) -> Result<usize, FrameError> {
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FrameError::MissingContentLength)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
