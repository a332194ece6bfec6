//! Session state machine scenario tests, driven over a scripted
//! transport: the harness feeds backend frames in and inspects the
//! frames the session sends back.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{LaunchError, SessionError, TransportError};
use crate::session::{BackendConnector, DebugSession, SessionNotice, SessionState};
use crate::testing::{scripted_stream, ScriptedHandle};
use crate::transport::ByteStream;

struct ScriptedConnector {
    stream: Option<Box<dyn ByteStream>>,
    backend_stopped: Arc<AtomicBool>,
}

impl BackendConnector for ScriptedConnector {
    fn launch(&mut self, _program: &Path, _output: Sender<String>) -> Result<(), LaunchError> {
        Ok(())
    }

    fn try_connect(&mut self) -> Result<Option<Box<dyn ByteStream>>, TransportError> {
        Ok(self.stream.take())
    }

    fn stop_backend(&mut self) {
        self.backend_stopped.store(true, Ordering::SeqCst);
    }
}

struct Harness {
    session: DebugSession,
    notices: Receiver<SessionNotice>,
    wire: ScriptedHandle,
    backend_stopped: Arc<AtomicBool>,
    backend_seq: u32,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let (stream, wire) = scripted_stream();
        let backend_stopped = Arc::new(AtomicBool::new(false));
        let connector = ScriptedConnector {
            stream: Some(Box::new(stream)),
            backend_stopped: Arc::clone(&backend_stopped),
        };
        let (session, notices) = DebugSession::new(Box::new(connector), 5678);
        Self {
            session,
            notices,
            wire,
            backend_stopped,
            backend_seq: 0,
        }
    }

    /// Start debugging and pump once: connects and sends `initialize`.
    fn start(&mut self) {
        self.session.start_debugging(Path::new("main.py")).unwrap();
        assert_eq!(self.session.state(), SessionState::Connecting);
        self.session.pump();
    }

    /// Frames the session has written since the last call, as JSON.
    fn sent(&mut self) -> Vec<Value> {
        self.wire
            .take_sent_payloads()
            .iter()
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    fn respond_ok(&mut self, request: &Value, body: Option<Value>) {
        self.respond(request, true, None, body);
    }

    fn respond(&mut self, request: &Value, success: bool, message: Option<&str>, body: Option<Value>) {
        self.backend_seq += 1;
        let mut response = json!({
            "seq": self.backend_seq,
            "type": "response",
            "request_seq": request["seq"],
            "success": success,
            "command": request["command"],
        });
        if let Some(message) = message {
            response["message"] = json!(message);
        }
        if let Some(body) = body {
            response["body"] = body;
        }
        self.wire.push_frame(&response.to_string());
        self.session.pump();
    }

    fn send_event(&mut self, event: &str, body: Option<Value>) {
        self.backend_seq += 1;
        let mut message = json!({
            "seq": self.backend_seq,
            "type": "event",
            "event": event,
        });
        if let Some(body) = body {
            message["body"] = body;
        }
        self.wire.push_frame(&message.to_string());
        self.session.pump();
    }

    fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Walk the full startup handshake and land in `Running`.
    fn drive_to_running(&mut self) {
        self.start();
        let sent = self.sent();
        assert_eq!(sent.len(), 1, "expected only initialize, got {sent:?}");
        let initialize = sent[0].clone();
        assert_eq!(initialize["command"], "initialize");

        self.respond_ok(&initialize, Some(json!({})));
        let sent = self.sent();
        let attach = sent
            .iter()
            .find(|req| req["command"] == "attach")
            .expect("attach after initialize response")
            .clone();
        self.respond_ok(&attach, None);

        self.send_event("initialized", None);
        let sent = self.sent();
        let config_done = sent
            .iter()
            .find(|req| req["command"] == "configurationDone")
            .expect("configurationDone after initialized event")
            .clone();
        for request in &sent {
            if request["command"] == "setBreakpoints" {
                let count = request["arguments"]["breakpoints"]
                    .as_array()
                    .map_or(0, Vec::len);
                let breakpoints: Vec<Value> = (0..count)
                    .map(|_| json!({"verified": true}))
                    .collect();
                let body = json!({ "breakpoints": breakpoints });
                self.respond_ok(request, Some(body));
            }
        }
        self.respond_ok(&config_done, None);
        assert_eq!(self.session.state(), SessionState::Running);
        self.drain_notices();
    }

    /// From `Running`, deliver a stop at `line` on `thread_id` and
    /// return the stackTrace request it triggered.
    fn stop_at(&mut self, thread_id: u32, line: u32) -> Value {
        self.send_event(
            "stopped",
            Some(json!({"reason": "breakpoint", "threadId": thread_id, "line": line})),
        );
        assert_eq!(self.session.state(), SessionState::Stopped);
        let sent = self.sent();
        let stack_trace = sent
            .iter()
            .find(|req| req["command"] == "stackTrace")
            .expect("stackTrace after stopped")
            .clone();
        assert_eq!(stack_trace["arguments"]["threadId"], json!(thread_id));
        stack_trace
    }
}

#[test]
fn connect_sends_initialize_with_client_identity() {
    let mut harness = Harness::new();
    harness.start();

    assert_eq!(harness.session.state(), SessionState::Initializing);
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let initialize = &sent[0];
    assert_eq!(initialize["type"], "request");
    assert_eq!(initialize["seq"], 1);
    assert_eq!(initialize["command"], "initialize");
    assert_eq!(initialize["arguments"]["clientID"], "RDV.IDE");
    assert_eq!(initialize["arguments"]["adapterID"], "debugpy");
    assert_eq!(initialize["arguments"]["linesStartAt1"], true);
}

#[test]
fn initialize_response_triggers_attach() {
    let mut harness = Harness::new();
    harness.start();
    let initialize = harness.sent()[0].clone();

    harness.respond_ok(&initialize, Some(json!({})));
    assert_eq!(harness.session.state(), SessionState::Initialized);

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    let attach = &sent[0];
    assert_eq!(attach["command"], "attach");
    assert_eq!(attach["arguments"]["connect"]["port"], json!(5678));
    assert_eq!(attach["arguments"]["justMyCode"], true);
}

#[test]
fn initialized_event_pushes_breakpoints_then_configuration_done() {
    let mut harness = Harness::new();
    harness.session.toggle_breakpoint("main.py", 10);
    harness.session.toggle_breakpoint("main.py", 20);

    harness.start();
    let initialize = harness.sent()[0].clone();
    harness.respond_ok(&initialize, Some(json!({})));
    let attach = harness.sent()[0].clone();
    harness.respond_ok(&attach, None);

    harness.send_event("initialized", None);
    let sent = harness.sent();
    assert_eq!(sent.len(), 2);
    // Breakpoints first, then configurationDone.
    assert_eq!(sent[0]["command"], "setBreakpoints");
    assert_eq!(sent[0]["arguments"]["source"]["path"], "main.py");
    // Editor lines 10 and 20 are 11 and 21 on the wire.
    assert_eq!(
        sent[0]["arguments"]["breakpoints"],
        json!([{"line": 11}, {"line": 21}])
    );
    assert_eq!(sent[1]["command"], "configurationDone");
    assert_eq!(harness.session.state(), SessionState::Running);
}

#[test]
fn breakpoint_verification_comes_from_the_backend() {
    let mut harness = Harness::new();
    harness.session.toggle_breakpoint("main.py", 10);
    harness.session.toggle_breakpoint("main.py", 20);
    harness.drive_to_running();

    // drive_to_running acknowledged both breakpoints as verified.
    let set_breakpoints = {
        harness.session.toggle_breakpoint("main.py", 30);
        let sent = harness.sent();
        sent[0].clone()
    };
    harness.respond_ok(
        &set_breakpoints,
        Some(json!({"breakpoints": [
            {"verified": true, "line": 11},
            {"verified": true, "line": 21},
            {"verified": false, "line": 31, "message": "no code at line"},
        ]})),
    );

    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::BreakpointsVerified {
        path: "main.py".to_string(),
        lines: vec![(10, true), (20, true), (30, false)],
    }));
}

#[test]
fn stopped_event_highlights_zero_based_line_and_requests_stack() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.send_event(
        "stopped",
        Some(json!({"reason": "breakpoint", "threadId": 1, "line": 42})),
    );
    assert_eq!(harness.session.state(), SessionState::Stopped);
    assert_eq!(harness.session.stopped_thread(), Some(1));

    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::HighlightLine {
        path: "main.py".to_string(),
        line: 41,
    }));

    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["command"], "stackTrace");
    assert_eq!(sent[0]["arguments"]["threadId"], json!(1));
}

#[test]
fn stopped_event_without_line_clamps_highlight_to_top() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.send_event("stopped", Some(json!({"reason": "pause", "threadId": 1})));
    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::HighlightLine {
        path: "main.py".to_string(),
        line: 0,
    }));

    // Line 0 (nominally invalid; lines are 1-based) clamps the same
    // way instead of wrapping.
    harness.sent();
    harness.send_event(
        "stopped",
        Some(json!({"reason": "pause", "threadId": 1, "line": 0})),
    );
    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::HighlightLine {
        path: "main.py".to_string(),
        line: 0,
    }));
}

#[test]
fn inspection_pipeline_publishes_flat_variable_rows() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    let stack_trace = harness.stop_at(1, 42);

    harness.respond_ok(
        &stack_trace,
        Some(json!({"stackFrames": [
            {"id": 7, "name": "main", "line": 42, "column": 1},
            {"id": 8, "name": "<module>", "line": 90, "column": 1},
        ]})),
    );
    let scopes = harness.sent()[0].clone();
    assert_eq!(scopes["command"], "scopes");
    assert_eq!(scopes["arguments"]["frameId"], json!(7));

    harness.respond_ok(
        &scopes,
        Some(json!({"scopes": [
            {"name": "Locals", "variablesReference": 3, "expensive": false},
            {"name": "Globals", "variablesReference": 4, "expensive": true},
        ]})),
    );
    let variables = harness.sent()[0].clone();
    assert_eq!(variables["command"], "variables");
    assert_eq!(variables["arguments"]["variablesReference"], json!(3));

    harness.respond_ok(
        &variables,
        Some(json!({"variables": [
            {"name": "x", "value": "1", "type": "int"},
            {"name": "s", "value": "'hi'"},
        ]})),
    );

    let notices = harness.drain_notices();
    let rows = notices
        .iter()
        .find_map(|notice| match notice {
            SessionNotice::VariablesReady(rows) => Some(rows.clone()),
            _ => None,
        })
        .expect("variables published");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "x");
    assert_eq!(rows[0].type_name, "int");
    // Missing type falls back the way the variables pane expects.
    assert_eq!(rows[1].type_name, "unknown");
}

#[test]
fn second_stop_discards_stale_pipeline_and_restarts() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    let first_stack_trace = harness.stop_at(1, 42);

    // A new stop arrives while the first stackTrace is outstanding.
    let second_stack_trace = harness.stop_at(2, 10);
    assert_eq!(harness.session.stopped_thread(), Some(2));
    harness.drain_notices();

    // The first pipeline's response arrives late; it must be dropped
    // without issuing a scopes request.
    harness.respond_ok(
        &first_stack_trace,
        Some(json!({"stackFrames": [{"id": 7, "name": "old", "line": 42, "column": 1}]})),
    );
    assert!(harness.sent().is_empty());
    assert!(harness.drain_notices().is_empty());

    // The fresh pipeline proceeds with the new frame identifiers.
    harness.respond_ok(
        &second_stack_trace,
        Some(json!({"stackFrames": [{"id": 21, "name": "new", "line": 10, "column": 1}]})),
    );
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["command"], "scopes");
    assert_eq!(sent[0]["arguments"]["frameId"], json!(21));
}

#[test]
fn run_control_requires_a_stopped_thread() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    assert!(matches!(
        harness.session.continue_(),
        Err(SessionError::NotStopped { command: "continue" })
    ));
    assert!(matches!(
        harness.session.step_over(),
        Err(SessionError::NotStopped { command: "next" })
    ));
    assert!(matches!(
        harness.session.step_in(),
        Err(SessionError::NotStopped { command: "stepIn" })
    ));
    assert!(matches!(
        harness.session.step_out(),
        Err(SessionError::NotStopped { command: "stepOut" })
    ));
    // Nothing reached the wire.
    assert!(harness.sent().is_empty());
}

#[test]
fn step_acknowledgement_returns_to_running_and_orphans_pipeline() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    let stack_trace = harness.stop_at(1, 42);

    harness.session.step_over().unwrap();
    let sent = harness.sent();
    assert_eq!(sent[0]["command"], "next");
    assert_eq!(sent[0]["arguments"]["threadId"], json!(1));

    harness.respond_ok(&sent[0].clone(), None);
    assert_eq!(harness.session.state(), SessionState::Running);

    // The stop's pipeline is now a different generation; its response
    // is stale and must not trigger a scopes request.
    harness.respond_ok(
        &stack_trace,
        Some(json!({"stackFrames": [{"id": 7, "name": "main", "line": 42, "column": 1}]})),
    );
    assert!(harness.sent().is_empty());
}

#[test]
fn rejected_command_surfaces_failure_and_keeps_state() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    harness.stop_at(1, 5);
    harness.drain_notices();

    harness.session.continue_().unwrap();
    let request = harness.sent()[0].clone();
    harness.respond(&request, false, Some("cannot continue"), None);

    assert_eq!(harness.session.state(), SessionState::Stopped);
    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::CommandFailed {
        command: "continue".to_string(),
        reason: "cannot continue".to_string(),
    }));
}

#[test]
fn rejected_attach_is_fatal_to_startup() {
    let mut harness = Harness::new();
    harness.start();
    let initialize = harness.sent()[0].clone();
    harness.respond_ok(&initialize, Some(json!({})));
    let attach = harness.sent()[0].clone();

    harness.respond(&attach, false, Some("connection refused"), None);
    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert!(harness.backend_stopped.load(Ordering::SeqCst));

    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::CommandFailed {
        command: "attach".to_string(),
        reason: "connection refused".to_string(),
    }));
}

#[test]
fn unmatched_response_is_dropped_without_corrupting_state() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.respond_ok(&json!({"seq": 999, "command": "continue"}), None);
    assert_eq!(harness.session.state(), SessionState::Running);

    // The session still reacts normally afterwards.
    harness.stop_at(1, 3);
}

#[test]
fn undecodable_frame_is_dropped_without_killing_the_session() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.wire.push_frame("this is not json");
    harness.session.pump();
    assert_eq!(harness.session.state(), SessionState::Running);

    harness.stop_at(1, 3);
}

#[test]
fn output_event_reaches_the_diagnostics_pane() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.send_event("output", Some(json!({"output": "hello from program\n"})));
    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::Output("hello from program".to_string())));
}

#[test]
fn backend_eof_terminates_from_any_state_and_fails_pending() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    harness.stop_at(1, 42);
    harness.drain_notices();

    // stackTrace is outstanding when the backend dies.
    harness.wire.close();
    harness.session.pump();

    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert!(harness.backend_stopped.load(Ordering::SeqCst));

    let notices = harness.drain_notices();
    assert!(notices.contains(&SessionNotice::CommandFailed {
        command: "stackTrace".to_string(),
        reason: "session terminated".to_string(),
    }));
    assert!(notices.contains(&SessionNotice::StateChanged(SessionState::Terminated)));

    // A terminated session refuses further commands.
    assert!(matches!(
        harness.session.continue_(),
        Err(SessionError::Terminated)
    ));
}

#[test]
fn stop_debugging_disconnects_then_terminates() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.session.stop_debugging().unwrap();
    assert_eq!(harness.session.state(), SessionState::Terminating);
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["command"], "disconnect");

    harness.respond_ok(&sent[0].clone(), None);
    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert!(harness.backend_stopped.load(Ordering::SeqCst));
}

#[test]
fn terminated_event_tears_the_session_down() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    harness.send_event("terminated", None);
    assert_eq!(harness.session.state(), SessionState::Terminated);
    assert!(harness.backend_stopped.load(Ordering::SeqCst));
}

#[test]
fn toggling_breakpoints_mid_run_pushes_the_new_set() {
    let mut harness = Harness::new();
    harness.drive_to_running();

    assert!(harness.session.toggle_breakpoint("util.py", 4));
    let sent = harness.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["command"], "setBreakpoints");
    assert_eq!(sent[0]["arguments"]["source"]["path"], "util.py");
    assert_eq!(sent[0]["arguments"]["breakpoints"], json!([{"line": 5}]));

    // Toggling off pushes the (now empty) set as well.
    assert!(!harness.session.toggle_breakpoint("util.py", 4));
    let sent = harness.sent();
    assert_eq!(sent[0]["arguments"]["breakpoints"], json!([]));
}

#[test]
fn start_debugging_is_rejected_while_a_run_is_active() {
    let mut harness = Harness::new();
    harness.drive_to_running();
    assert!(matches!(
        harness.session.start_debugging(Path::new("other.py")),
        Err(SessionError::AlreadyActive)
    ));
}
