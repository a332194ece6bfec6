//! Per-source breakpoint store.
//! - toggle/snapshot keyed by (path, line), lines 0-based (editor
//!   coordinates; the session converts to 1-based on the wire)
//! - verified flags come only from backend acknowledgements

use std::collections::BTreeMap;

use indexmap::IndexMap;

use rdv_dap::Breakpoint as WireBreakpoint;

/// One breakpoint as the IDE sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakpointState {
    /// Set from the backend's `setBreakpoints` response, never
    /// inferred locally.
    pub verified: bool,
}

/// Breakpoints grouped per source path, ordered by line within a
/// source and by toggle order across sources.
#[derive(Debug, Default)]
pub struct BreakpointStore {
    by_source: IndexMap<String, BTreeMap<u32, BreakpointState>>,
}

impl BreakpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent set semantics: present is removed, absent is added.
    /// Returns whether the breakpoint is present afterwards.
    pub fn toggle(&mut self, path: &str, line: u32) -> bool {
        let lines = self.by_source.entry(path.to_string()).or_default();
        if lines.remove(&line).is_some() {
            if lines.is_empty() {
                self.by_source.shift_remove(path);
            }
            false
        } else {
            lines.insert(line, BreakpointState::default());
            true
        }
    }

    /// Ordered set of breakpoint lines for one source.
    #[must_use]
    pub fn snapshot(&self, path: &str) -> Vec<u32> {
        self.by_source
            .get(path)
            .map(|lines| lines.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sources that currently carry at least one breakpoint.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.by_source.keys().map(String::as_str)
    }

    /// Apply per-breakpoint verification from a `setBreakpoints`
    /// response. The backend answers positionally in request order;
    /// a reported 1-based line overrides the positional match.
    pub fn apply_verification(&mut self, path: &str, acknowledged: &[WireBreakpoint]) {
        let Some(lines) = self.by_source.get_mut(path) else {
            return;
        };
        let ordered: Vec<u32> = lines.keys().copied().collect();
        for (index, ack) in acknowledged.iter().enumerate() {
            let line = ack
                .line
                .map(|wire_line| wire_line.saturating_sub(1))
                .or_else(|| ordered.get(index).copied());
            if let Some(line) = line {
                if let Some(state) = lines.get_mut(&line) {
                    state.verified = ack.verified;
                }
            }
        }
    }

    /// Verification state for one breakpoint, if it exists.
    #[must_use]
    pub fn state(&self, path: &str, line: u32) -> Option<BreakpointState> {
        self.by_source.get(path)?.get(&line).copied()
    }

    pub fn clear(&mut self) {
        self.by_source.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}
