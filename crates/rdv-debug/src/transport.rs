//! Transport channel over a nonblocking byte stream.
//! - ByteStream: minimal read/write seam (TCP in production)
//! - TransportChannel: receive buffer + frame extraction + send path

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use rdv_dap::{encode_frame, FrameBuffer};

use crate::error::TransportError;

const READ_CHUNK: usize = 4096;
const WRITE_RETRY_SLEEP: Duration = Duration::from_millis(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-level seam under the transport. Reads are nonblocking:
/// `Ok(0)` means the peer closed, `ErrorKind::WouldBlock` means no
/// bytes right now.
pub trait ByteStream: Send {
    /// Read whatever is available into `buf`.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the full slice.
    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Best-effort close of both directions.
    fn shutdown(&mut self);
}

/// Nonblocking TCP stream, the production [`ByteStream`].
pub struct TcpByteStream {
    stream: TcpStream,
}

impl TcpByteStream {
    /// Connect to the backend with a bounded timeout and switch the
    /// socket to nonblocking mode for polled reads.
    ///
    /// # Errors
    ///
    /// Fails when the address is unresolvable, the connect times out,
    /// or the socket cannot be made nonblocking.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let connect = |source: io::Error| TransportError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(connect)?;
        stream.set_nodelay(true).map_err(connect)?;
        stream.set_nonblocking(true).map_err(connect)?;
        Ok(Self { stream })
    }
}

impl ByteStream for TcpByteStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        // The socket is nonblocking for the polled read path, so a
        // send can hit WouldBlock mid-frame; retry with a bounded
        // deadline instead of losing half a frame.
        let mut written = 0;
        let deadline = Instant::now() + WRITE_TIMEOUT;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "backend stopped accepting bytes",
                    ))
                }
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "backend socket not writable",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_SLEEP);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Owns the raw stream to the backend plus the frame buffer, and
/// never blocks its caller: [`TransportChannel::poll`] drains whatever
/// is readable and returns every complete payload buffered so far.
pub struct TransportChannel {
    stream: Box<dyn ByteStream>,
    buffer: FrameBuffer,
    closed: bool,
}

impl TransportChannel {
    #[must_use]
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            closed: false,
        }
    }

    /// Frame and send one payload.
    ///
    /// # Errors
    ///
    /// Fails when the channel is closed or the write fails.
    pub fn send_payload(&mut self, payload: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        trace!(len = payload.len(), "sending frame");
        self.stream.write_all_bytes(&encode_frame(payload))?;
        Ok(())
    }

    /// Drain readable bytes and extract every complete payload.
    ///
    /// Chunked and concatenated deliveries decode identically because
    /// extraction always runs the buffer to exhaustion. When the peer
    /// has closed, any payloads already buffered are still returned;
    /// the next poll reports [`TransportError::Closed`].
    ///
    /// # Errors
    ///
    /// Framing errors and socket failures are fatal to the channel.
    pub fn poll(&mut self) -> Result<Vec<String>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.closed {
            match self.stream.read_available(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(count) => self.buffer.extend(&chunk[..count])?,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.closed = true;
                    return Err(TransportError::Io(err));
                }
            }
        }

        let mut payloads = Vec::new();
        while let Some(payload) = self.buffer.next_payload()? {
            payloads.push(payload);
        }
        if payloads.is_empty() && self.closed {
            return Err(TransportError::Closed);
        }
        Ok(payloads)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tear the channel down; further sends and polls fail.
    pub fn close(&mut self) {
        self.closed = true;
        self.stream.shutdown();
        self.buffer.reset();
    }
}
