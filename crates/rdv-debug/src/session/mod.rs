//! Debug session state machine.
//! - DebugSession: owns transport, sequencer, breakpoints, pipeline
//! - pump(): the single dispatch point (connect, poll, dispatch)
//! - pipeline: stack inspection, in pipeline.rs

pub(crate) mod pipeline;

pub use pipeline::PipelineStage;

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use rdv_dap::{
    AttachArguments, ConnectArguments, ContinueArguments, DisconnectArguments, Event,
    InitializeArguments, Message, NextArguments, OutputEventBody, Response,
    SetBreakpointsArguments, SetBreakpointsResponseBody, Source, SourceBreakpoint,
    StepInArguments, StepOutArguments, StoppedEventBody,
};

use crate::breakpoints::BreakpointStore;
use crate::error::{LaunchError, SessionError, TransportError};
use crate::launcher::{DebugLauncher, DEFAULT_DAP_PORT};
use crate::sequencer::{PendingRequest, RequestPurpose, RequestTracker};
use crate::transport::{ByteStream, TcpByteStream, TransportChannel};

use self::pipeline::InspectPipeline;

const DEFAULT_THREAD_ID: u32 = 1;
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(200);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one debug run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Initializing,
    Initialized,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

/// One row of the published variables listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRow {
    pub name: String,
    pub value: String,
    pub type_name: String,
}

/// Notifications crossing the boundary to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged(SessionState),
    /// Free-text diagnostics and program output.
    Output(String),
    /// Execution stopped at this 0-based line.
    HighlightLine { path: String, line: u32 },
    /// Flat listing for the variables pane.
    VariablesReady(Vec<VariableRow>),
    /// Backend acknowledged breakpoints for one source.
    BreakpointsVerified {
        path: String,
        lines: Vec<(u32, bool)>,
    },
    /// A command could not be completed.
    CommandFailed { command: String, reason: String },
}

/// Seam between the session and the outside world: spawning the
/// backend process and opening the socket to it. Injected at
/// construction so tests can drive the session with scripted bytes.
pub trait BackendConnector: Send {
    /// Spawn the backend for `program`; diagnostics lines go through
    /// `output`.
    ///
    /// # Errors
    ///
    /// Launch failures surface before any connection attempt.
    fn launch(&mut self, program: &Path, output: Sender<String>) -> Result<(), LaunchError>;

    /// One nonblocking connection attempt. `Ok(None)` means the
    /// backend is not accepting yet; try again on the next pump.
    ///
    /// # Errors
    ///
    /// A definitive connection failure is fatal.
    fn try_connect(&mut self) -> Result<Option<Box<dyn ByteStream>>, TransportError>;

    /// Stop the backend process (graceful, bounded, then forced).
    fn stop_backend(&mut self);
}

/// Production connector: debugpy over loopback TCP.
pub struct DebugpyConnector {
    host: String,
    port: u16,
    launcher: Option<DebugLauncher>,
}

impl DebugpyConnector {
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            launcher: None,
        }
    }
}

impl BackendConnector for DebugpyConnector {
    fn launch(&mut self, program: &Path, output: Sender<String>) -> Result<(), LaunchError> {
        self.launcher = Some(DebugLauncher::start(program, self.port, output)?);
        Ok(())
    }

    fn try_connect(&mut self) -> Result<Option<Box<dyn ByteStream>>, TransportError> {
        let addr = format!("{}:{}", self.host, self.port)
            .parse::<std::net::SocketAddr>()
            .map_err(|_| TransportError::Connect {
                addr: format!("{}:{}", self.host, self.port),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address"),
            })?;
        match TcpByteStream::connect(addr, CONNECT_ATTEMPT_TIMEOUT) {
            Ok(stream) => Ok(Some(Box::new(stream))),
            // Refused just means debugpy is not listening yet.
            Err(TransportError::Connect { source, .. })
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn stop_backend(&mut self) {
        if let Some(mut launcher) = self.launcher.take() {
            launcher.stop();
        }
    }
}

/// The session controller: one instance per debug run, all commands
/// funneled through it, all inbound frames dispatched in arrival
/// order by [`DebugSession::pump`].
pub struct DebugSession {
    state: SessionState,
    connector: Box<dyn BackendConnector>,
    transport: Option<TransportChannel>,
    tracker: RequestTracker,
    breakpoints: BreakpointStore,
    pub(crate) pipeline: Option<InspectPipeline>,
    /// Bumped on every stopped/continue/step transition; outstanding
    /// pipeline requests from older generations are stale.
    pub(crate) generation: u64,
    stopped_thread: Option<u32>,
    program: Option<PathBuf>,
    host: String,
    port: u16,
    connect_deadline: Option<Instant>,
    disconnect_deadline: Option<Instant>,
    backend_output: Option<Receiver<String>>,
    notices: Sender<SessionNotice>,
}

impl DebugSession {
    /// Build a session around an injected connector. Returns the
    /// receiving end of the presentation boundary.
    #[must_use]
    pub fn new(connector: Box<dyn BackendConnector>, port: u16) -> (Self, Receiver<SessionNotice>) {
        let (notices, notice_rx) = mpsc::channel();
        (
            Self {
                state: SessionState::Disconnected,
                connector,
                transport: None,
                tracker: RequestTracker::new(),
                breakpoints: BreakpointStore::new(),
                pipeline: None,
                generation: 0,
                stopped_thread: None,
                program: None,
                host: "localhost".to_string(),
                port,
                connect_deadline: None,
                disconnect_deadline: None,
                backend_output: None,
                notices,
            },
            notice_rx,
        )
    }

    /// Session wired to a local debugpy backend on the default port.
    #[must_use]
    pub fn for_debugpy() -> (Self, Receiver<SessionNotice>) {
        Self::new(Box::new(DebugpyConnector::new(DEFAULT_DAP_PORT)), DEFAULT_DAP_PORT)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn stopped_thread(&self) -> Option<u32> {
        self.stopped_thread
    }

    // ------------------------------------------------------------------
    // Command entry points (presentation boundary)
    // ------------------------------------------------------------------

    /// Spawn the backend for `program` and begin connecting.
    ///
    /// # Errors
    ///
    /// Rejected while a run is active; launch failures leave the
    /// session `Disconnected`.
    pub fn start_debugging(&mut self, program: &Path) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected | SessionState::Terminated => {}
            _ => return Err(SessionError::AlreadyActive),
        }

        // Fresh run: protocol state resets, breakpoints belong to the
        // IDE and survive across runs.
        self.tracker = RequestTracker::new();
        self.pipeline = None;
        self.generation = 0;
        self.stopped_thread = None;
        self.transport = None;
        self.disconnect_deadline = None;

        let (output_tx, output_rx) = mpsc::channel();
        self.connector.launch(program, output_tx)?;
        self.backend_output = Some(output_rx);
        self.program = Some(program.to_path_buf());
        self.connect_deadline = Some(Instant::now() + CONNECT_DEADLINE);
        info!(program = %program.display(), "debug backend launched");
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Resume the stopped thread.
    ///
    /// # Errors
    ///
    /// Rejected (and nothing is sent) unless a thread is stopped.
    pub fn continue_(&mut self) -> Result<(), SessionError> {
        let thread_id = self.require_stopped("continue")?;
        let args = serde_json::to_value(ContinueArguments { thread_id })?;
        self.send_request("continue", Some(args), RequestPurpose::RunControl);
        Ok(())
    }

    /// Step over the current line.
    ///
    /// # Errors
    ///
    /// Rejected unless a thread is stopped.
    pub fn step_over(&mut self) -> Result<(), SessionError> {
        let thread_id = self.require_stopped("next")?;
        let args = serde_json::to_value(NextArguments { thread_id })?;
        self.send_request("next", Some(args), RequestPurpose::RunControl);
        Ok(())
    }

    /// Step into the call at the current line.
    ///
    /// # Errors
    ///
    /// Rejected unless a thread is stopped.
    pub fn step_in(&mut self) -> Result<(), SessionError> {
        let thread_id = self.require_stopped("stepIn")?;
        let args = serde_json::to_value(StepInArguments { thread_id })?;
        self.send_request("stepIn", Some(args), RequestPurpose::RunControl);
        Ok(())
    }

    /// Step out of the current frame.
    ///
    /// # Errors
    ///
    /// Rejected unless a thread is stopped.
    pub fn step_out(&mut self) -> Result<(), SessionError> {
        let thread_id = self.require_stopped("stepOut")?;
        let args = serde_json::to_value(StepOutArguments { thread_id })?;
        self.send_request("stepOut", Some(args), RequestPurpose::RunControl);
        Ok(())
    }

    /// Wind the session down: request a disconnect and give the
    /// backend a bounded grace period before forcing teardown.
    ///
    /// # Errors
    ///
    /// Rejected when no session is live.
    pub fn stop_debugging(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected => return Err(SessionError::NotConnected),
            SessionState::Terminated => return Err(SessionError::Terminated),
            SessionState::Terminating => return Ok(()),
            SessionState::Connecting => {
                // No transport yet; nothing to disconnect politely.
                self.terminate("stopped before connection");
                return Ok(());
            }
            _ => {}
        }
        self.set_state(SessionState::Terminating);
        self.disconnect_deadline = Some(Instant::now() + DISCONNECT_GRACE);
        let args = serde_json::to_value(DisconnectArguments {
            terminate_debuggee: Some(true),
        })?;
        self.send_request("disconnect", Some(args), RequestPurpose::Lifecycle);
        Ok(())
    }

    /// Toggle a breakpoint at a 0-based editor line. While a run is
    /// configured the new set is pushed to the backend immediately.
    pub fn toggle_breakpoint(&mut self, path: &str, line: u32) -> bool {
        let present = self.breakpoints.toggle(path, line);
        if matches!(self.state, SessionState::Running | SessionState::Stopped) {
            self.push_breakpoints(path);
        }
        present
    }

    /// Ordered breakpoint lines for one source (0-based).
    #[must_use]
    pub fn breakpoint_lines(&self, path: &str) -> Vec<u32> {
        self.breakpoints.snapshot(path)
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Advance the session: forward backend diagnostics, progress the
    /// connection, poll the transport, and dispatch every decoded
    /// message in arrival order. Never blocks.
    pub fn pump(&mut self) {
        self.forward_backend_output();
        match self.state {
            SessionState::Disconnected | SessionState::Terminated => {}
            SessionState::Connecting => self.advance_connection(),
            _ => {
                self.poll_transport();
                if self.state == SessionState::Terminating {
                    if let Some(deadline) = self.disconnect_deadline {
                        if Instant::now() >= deadline {
                            self.terminate("disconnect timed out");
                        }
                    }
                }
            }
        }
    }

    fn forward_backend_output(&mut self) {
        let Some(rx) = self.backend_output.as_ref() else {
            return;
        };
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        for line in lines {
            self.notify(SessionNotice::Output(line));
        }
    }

    fn advance_connection(&mut self) {
        match self.connector.try_connect() {
            Ok(Some(stream)) => {
                self.transport = Some(TransportChannel::new(stream));
                self.connect_deadline = None;
                info!("connected to debug backend");
                self.set_state(SessionState::Initializing);
                self.send_initialize();
            }
            Ok(None) => {
                if self
                    .connect_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline)
                {
                    warn!("backend never started listening");
                    self.notify(SessionNotice::Output(
                        "could not connect to the debug backend".to_string(),
                    ));
                    self.terminate("connect timed out");
                }
            }
            Err(err) => {
                warn!(error = %err, "connection to debug backend failed");
                self.terminate("connection failed");
            }
        }
    }

    fn poll_transport(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let payloads = match transport.poll() {
            Ok(payloads) => payloads,
            Err(TransportError::Closed) => {
                info!("backend closed the connection");
                self.terminate("backend connection closed");
                return;
            }
            Err(err) => {
                warn!(error = %err, "transport failure");
                self.terminate("transport failure");
                return;
            }
        };

        for payload in payloads {
            // Teardown mid-batch must not let later frames resurrect
            // session state.
            if self.state == SessionState::Terminated {
                break;
            }
            self.handle_payload(&payload);
        }
    }

    fn handle_payload(&mut self, payload: &str) {
        match Message::decode(payload) {
            Ok(Message::Event(event)) => self.handle_event(&event),
            Ok(Message::Response(response)) => self.handle_response(response),
            Ok(Message::Request(request)) => {
                // Reverse requests (runInTerminal and friends) are not
                // served by this client.
                debug!(command = %request.command, "ignoring backend-originated request");
            }
            Err(err) => {
                warn!(error = %err, "undecodable message dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: &Event) {
        match event.event.as_str() {
            "initialized" => self.on_initialized_event(),
            "stopped" => self.on_stopped_event(event.body.clone()),
            "continued" => {
                if self.state == SessionState::Stopped {
                    self.leave_stopped();
                    self.set_state(SessionState::Running);
                }
            }
            "output" => {
                let output = event
                    .body
                    .clone()
                    .and_then(|body| serde_json::from_value::<OutputEventBody>(body).ok())
                    .map(|body| body.output)
                    .unwrap_or_default();
                let trimmed = output.trim_end();
                if !trimmed.is_empty() {
                    self.notify(SessionNotice::Output(trimmed.to_string()));
                }
            }
            "terminated" | "exited" => {
                info!(event = %event.event, "backend finished");
                self.terminate("backend terminated");
            }
            other => debug!(event = other, "unhandled event"),
        }
    }

    fn on_initialized_event(&mut self) {
        if !matches!(
            self.state,
            SessionState::Initializing | SessionState::Initialized
        ) {
            debug!(state = ?self.state, "unexpected initialized event");
            return;
        }
        // Configuration phase: push the current breakpoints, then
        // declare configuration finished.
        let sources: Vec<String> = self.breakpoints.sources().map(str::to_string).collect();
        for path in sources {
            self.push_breakpoints(&path);
        }
        self.send_request("configurationDone", None, RequestPurpose::Lifecycle);
        self.set_state(SessionState::Running);
    }

    fn on_stopped_event(&mut self, body: Option<Value>) {
        let body = body
            .and_then(|value| serde_json::from_value::<StoppedEventBody>(value).ok())
            .unwrap_or(StoppedEventBody {
                reason: String::new(),
                thread_id: None,
                line: None,
                all_threads_stopped: None,
            });

        let thread_id = body.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        self.stopped_thread = Some(thread_id);
        self.set_state(SessionState::Stopped);

        if !body.reason.is_empty() {
            self.notify(SessionNotice::Output(format!("stopped: {}", body.reason)));
        }
        if let Some(path) = self.program.as_ref().map(|p| p.display().to_string()) {
            // The backend reports 1-based lines; the editor wants
            // 0-based. A missing or zero line clamps to the top.
            let line = body.line.unwrap_or(1).saturating_sub(1);
            self.notify(SessionNotice::HighlightLine { path, line });
        }

        self.start_inspection(thread_id);
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    fn handle_response(&mut self, response: Response) {
        let Some(pending) = self.tracker.resolve(&response) else {
            warn!(
                request_seq = response.request_seq,
                command = %response.command,
                "response matches no pending request; dropped"
            );
            return;
        };

        if let RequestPurpose::Pipeline { generation, .. } = &pending.purpose {
            if *generation != self.generation {
                debug!(
                    command = %pending.command,
                    stale = *generation,
                    current = self.generation,
                    "stale pipeline response discarded"
                );
                return;
            }
        }

        if !response.success {
            self.on_command_rejected(&pending, response.message.as_deref());
            return;
        }

        match &pending.purpose {
            RequestPurpose::Lifecycle => self.on_lifecycle_response(&pending),
            RequestPurpose::RunControl => {
                if self.state == SessionState::Stopped {
                    self.leave_stopped();
                    self.set_state(SessionState::Running);
                }
            }
            RequestPurpose::SetBreakpoints { path } => {
                let path = path.clone();
                self.on_breakpoints_response(&path, response.body);
            }
            RequestPurpose::Pipeline { stage, .. } => {
                self.advance_inspection(*stage, response.body);
            }
        }
    }

    fn on_lifecycle_response(&mut self, pending: &PendingRequest) {
        match pending.command.as_str() {
            "initialize" => {
                if self.state == SessionState::Initializing {
                    self.set_state(SessionState::Initialized);
                    self.send_attach();
                } else {
                    debug!(state = ?self.state, "late initialize response");
                }
            }
            "attach" | "configurationDone" => {
                debug!(command = %pending.command, "acknowledged");
            }
            "disconnect" => self.terminate("disconnected"),
            other => debug!(command = other, "unrouted lifecycle response"),
        }
    }

    fn on_breakpoints_response(&mut self, path: &str, body: Option<Value>) {
        let Some(body) =
            body.and_then(|value| serde_json::from_value::<SetBreakpointsResponseBody>(value).ok())
        else {
            warn!(path, "malformed setBreakpoints response body; dropped");
            return;
        };
        self.breakpoints.apply_verification(path, &body.breakpoints);
        let lines = self
            .breakpoints
            .snapshot(path)
            .into_iter()
            .map(|line| {
                let verified = self
                    .breakpoints
                    .state(path, line)
                    .is_some_and(|state| state.verified);
                (line, verified)
            })
            .collect();
        self.notify(SessionNotice::BreakpointsVerified {
            path: path.to_string(),
            lines,
        });
    }

    fn on_command_rejected(&mut self, pending: &PendingRequest, message: Option<&str>) {
        let reason = message.unwrap_or("command rejected by backend").to_string();
        warn!(command = %pending.command, reason = %reason, "command rejected");
        self.notify(SessionNotice::CommandFailed {
            command: pending.command.clone(),
            reason,
        });
        if let RequestPurpose::Pipeline { .. } = pending.purpose {
            self.pipeline = None;
        }
        match pending.command.as_str() {
            // The startup sequence cannot recover from a refusal.
            "initialize" | "attach" | "configurationDone" => {
                self.terminate("startup rejected by backend");
            }
            // A refused disconnect still ends the session on our side.
            "disconnect" => self.terminate("disconnect rejected"),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    fn send_initialize(&mut self) {
        let args = InitializeArguments {
            client_id: "RDV.IDE".to_string(),
            adapter_id: "debugpy".to_string(),
            path_format: "path".to_string(),
            lines_start_at1: true,
            columns_start_at1: true,
            supports_variable_type: true,
            supports_variable_paging: true,
            supports_run_in_terminal_request: true,
        };
        let args = serde_json::to_value(args).ok();
        self.send_request("initialize", args, RequestPurpose::Lifecycle);
    }

    fn send_attach(&mut self) {
        let args = AttachArguments {
            name: "Attach to debugpy".to_string(),
            adapter_type: "python".to_string(),
            request: "attach".to_string(),
            connect: ConnectArguments {
                host: self.host.clone(),
                port: self.port,
            },
            just_my_code: true,
        };
        let args = serde_json::to_value(args).ok();
        self.send_request("attach", args, RequestPurpose::Lifecycle);
    }

    fn push_breakpoints(&mut self, path: &str) {
        let breakpoints = self
            .breakpoints
            .snapshot(path)
            .into_iter()
            .map(|line| SourceBreakpoint { line: line + 1 })
            .collect();
        let args = SetBreakpointsArguments {
            source: Source {
                name: None,
                path: Some(path.to_string()),
            },
            breakpoints,
        };
        let args = serde_json::to_value(args).ok();
        self.send_request(
            "setBreakpoints",
            args,
            RequestPurpose::SetBreakpoints {
                path: path.to_string(),
            },
        );
    }

    pub(crate) fn send_request(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        purpose: RequestPurpose,
    ) {
        let request = self.tracker.issue(command, arguments, purpose);
        let message = Message::Request(request);
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(command, error = %err, "failed to encode request");
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            warn!(command, "no transport; request dropped");
            return;
        };
        if let Err(err) = transport.send_payload(&payload) {
            warn!(command, error = %err, "send failed");
            self.terminate("transport failure");
        }
    }

    // ------------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------------

    fn require_stopped(&self, command: &'static str) -> Result<u32, SessionError> {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        if self.state != SessionState::Stopped {
            return Err(SessionError::NotStopped { command });
        }
        Ok(self.stopped_thread.unwrap_or(DEFAULT_THREAD_ID))
    }

    /// Leaving `Stopped` invalidates every `variablesReference` handed
    /// out for the old stop, so the pipeline generation advances.
    fn leave_stopped(&mut self) {
        self.generation += 1;
        self.pipeline = None;
        self.stopped_thread = None;
    }

    /// Teardown, in an order that never lets a late frame resurrect
    /// the session: stop polling, fail pending, drop the pipeline,
    /// close the socket, stop the backend.
    fn terminate(&mut self, reason: &str) {
        if self.state == SessionState::Terminated {
            return;
        }
        debug!(reason, "terminating session");

        self.state = SessionState::Terminated;
        self.connect_deadline = None;
        self.disconnect_deadline = None;

        for pending in self.tracker.fail_all() {
            self.notify(SessionNotice::CommandFailed {
                command: pending.command,
                reason: "session terminated".to_string(),
            });
        }

        self.pipeline = None;
        self.generation += 1;
        self.stopped_thread = None;

        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.connector.stop_backend();

        self.notify(SessionNotice::StateChanged(SessionState::Terminated));
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state change");
            self.state = next;
            self.notify(SessionNotice::StateChanged(next));
        }
    }

    pub(crate) fn notify(&self, notice: SessionNotice) {
        // The presentation side owning the receiver may be gone during
        // shutdown; notices are then dropped on the floor.
        let _ = self.notices.send(notice);
    }
}
