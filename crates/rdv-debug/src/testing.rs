//! Test doubles for the transport seam.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::transport::ByteStream;

#[derive(Default)]
struct ScriptedState {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    eof: bool,
}

/// Scripted byte stream: hands out queued chunks on reads, records
/// writes. The paired [`ScriptedHandle`] keeps feeding and inspecting
/// it after the stream itself has been boxed into a channel.
pub(crate) struct ScriptedStream {
    state: Arc<Mutex<ScriptedState>>,
}

/// Test-side handle to a [`ScriptedStream`].
#[derive(Clone)]
pub(crate) struct ScriptedHandle {
    state: Arc<Mutex<ScriptedState>>,
}

pub(crate) fn scripted_stream() -> (ScriptedStream, ScriptedHandle) {
    let state = Arc::new(Mutex::new(ScriptedState::default()));
    (
        ScriptedStream {
            state: Arc::clone(&state),
        },
        ScriptedHandle { state },
    )
}

impl ScriptedHandle {
    pub(crate) fn push_bytes(&self, bytes: Vec<u8>) {
        self.state.lock().unwrap().incoming.push_back(bytes);
    }

    pub(crate) fn push_frame(&self, payload: &str) {
        self.push_bytes(rdv_dap::encode_frame(payload));
    }

    pub(crate) fn close(&self) {
        self.state.lock().unwrap().eof = true;
    }

    /// Everything written to the wire since the last call, decoded
    /// back into frame payloads.
    pub(crate) fn take_sent_payloads(&self) -> Vec<String> {
        let bytes = std::mem::take(&mut self.state.lock().unwrap().written);
        let mut buffer = rdv_dap::FrameBuffer::new();
        buffer.extend(&bytes).unwrap();
        let mut payloads = Vec::new();
        while let Some(payload) = buffer.next_payload().unwrap() {
            payloads.push(payload);
        }
        payloads
    }
}

impl ByteStream for ScriptedStream {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match state.incoming.pop_front() {
            Some(chunk) => {
                assert!(chunk.len() <= buf.len(), "scripted chunk too large");
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None if state.eof => Ok(0),
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no data")),
        }
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.state.lock().unwrap().written.extend_from_slice(bytes);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().eof = true;
    }
}
