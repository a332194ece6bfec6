//! Debug Adapter Protocol (DAP) wire layer for the RDV IDE.
//! - protocol: typed request/response/event messages and bodies
//! - framing: `Content-Length` frame extraction and encoding

mod framing;
mod protocol;

pub use framing::{encode_frame, FrameBuffer, FrameError, MAX_BUFFERED_BYTES};
pub use protocol::{
    AttachArguments, Breakpoint, ConnectArguments, ContinueArguments, ContinuedEventBody,
    DisconnectArguments, Event, ExitedEventBody, InitializeArguments, Message, NextArguments,
    OutputEventBody, Request, Response, Scope, ScopesArguments, ScopesResponseBody,
    SetBreakpointsArguments, SetBreakpointsResponseBody, Source, SourceBreakpoint, StackFrame,
    StackTraceArguments, StackTraceResponseBody, StepInArguments, StepOutArguments,
    StoppedEventBody, TerminatedEventBody, Variable, VariablesArguments, VariablesResponseBody,
};
