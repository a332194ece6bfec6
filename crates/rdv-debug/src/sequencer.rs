//! Request sequencing and response correlation.
//! - RequestTracker: monotonic seq allocation + pending set
//! - PendingRequest: what was sent, when, and why

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;

use rdv_dap::{Request, Response};

use crate::session::pipeline::PipelineStage;

/// Why a request was issued; drives how its response is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPurpose {
    /// Session lifecycle (`initialize`, `attach`, `configurationDone`,
    /// `disconnect`).
    Lifecycle,
    /// User-issued run control (`continue`, `next`, `stepIn`,
    /// `stepOut`).
    RunControl,
    /// `setBreakpoints` for one source.
    SetBreakpoints { path: String },
    /// One stage of the stack-inspection pipeline. Responses whose
    /// generation no longer matches the session's are discarded.
    Pipeline {
        generation: u64,
        stage: PipelineStage,
    },
}

/// A request that has been sent and not yet answered. Owned by the
/// tracker from send until a matching response arrives or the session
/// tears down, whichever comes first.
#[derive(Debug)]
pub struct PendingRequest {
    pub seq: u32,
    pub command: String,
    pub issued_at: Instant,
    pub purpose: RequestPurpose,
}

/// Allocates sequence numbers (starting at 1, strictly increasing,
/// never reused within a session) and matches responses back to their
/// requests by `request_seq`. Correlation is by lookup, not FIFO, so
/// reordered responses resolve correctly.
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_seq: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl RequestTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next seq, record the pending request, and build
    /// the wire envelope for the caller to send.
    pub fn issue(
        &mut self,
        command: &str,
        arguments: Option<Value>,
        purpose: RequestPurpose,
    ) -> Request {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            PendingRequest {
                seq,
                command: command.to_string(),
                issued_at: Instant::now(),
                purpose,
            },
        );
        Request {
            seq,
            command: command.to_string(),
            arguments,
        }
    }

    /// Match a response to its pending request and remove it. `None`
    /// is a protocol violation: nothing was waiting on that
    /// `request_seq` (or it was already completed).
    pub fn resolve(&mut self, response: &Response) -> Option<PendingRequest> {
        self.pending.remove(&response.request_seq)
    }

    /// Drain every outstanding request on teardown so no issuer is
    /// left waiting. Returned in issue order.
    pub fn fail_all(&mut self) -> Vec<PendingRequest> {
        let mut drained: Vec<PendingRequest> = self.pending.drain().map(|(_, req)| req).collect();
        drained.sort_by_key(|req| req.seq);
        drained
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
