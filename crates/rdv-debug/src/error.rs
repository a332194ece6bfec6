//! Session-layer errors.

#![allow(missing_docs)]

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use rdv_dap::FrameError;

/// Transport failures. Every one of these is fatal to the session and
/// forces the `Terminated` state.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Backend closed the connection.
    #[error("connection closed by backend")]
    Closed,

    /// Connection could not be established.
    #[error("failed to connect to backend at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// Framing broke down on the receive path.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket read or write failed.
    #[error("transport i/o failure: {0}")]
    Io(#[from] io::Error),
}

/// Failures spawning or supervising the backend process. Surfaced
/// before any transport connection is attempted.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program to debug does not exist on disk.
    #[error("program '{0}' does not exist")]
    MissingProgram(PathBuf),

    /// The backend interpreter could not be started.
    #[error("failed to start debug backend '{command}': {source}")]
    Spawn { command: String, source: io::Error },
}

/// Caller-facing command errors. These never reach the backend.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A run-control command was issued while no thread is stopped.
    #[error("'{command}' requires a stopped thread")]
    NotStopped { command: &'static str },

    /// `start_debugging` was called while a session is already live.
    #[error("a debug session is already active")]
    AlreadyActive,

    /// A command was issued after the session reached `Terminated`.
    #[error("debug session is terminated")]
    Terminated,

    /// There is no transport to send on.
    #[error("no active backend connection")]
    NotConnected,

    /// Launching the backend failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The transport failed while sending.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
