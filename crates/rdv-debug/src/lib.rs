//! Debug session core for the RDV IDE.
//! - launcher: spawns and supervises the debugpy backend process
//! - transport: nonblocking channel with DAP framing
//! - sequencer: request seq allocation + response correlation
//! - breakpoints: per-source breakpoint store
//! - session: the state machine driving one debug run

mod breakpoints;
mod error;
mod launcher;
mod sequencer;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use breakpoints::{BreakpointState, BreakpointStore};
pub use error::{LaunchError, SessionError, TransportError};
pub use launcher::{DebugLauncher, DEFAULT_DAP_PORT};
pub use sequencer::{PendingRequest, RequestPurpose, RequestTracker};
pub use session::{
    BackendConnector, DebugSession, DebugpyConnector, PipelineStage, SessionNotice, SessionState,
    VariableRow,
};
pub use transport::{ByteStream, TcpByteStream, TransportChannel};
