//! Stack-inspection pipeline: stackTrace -> scopes -> variables.
//!
//! One pipeline runs per `stopped` event. Each stage depends on data
//! from the previous response, so the stages are strictly sequential.
//! A new `stopped` (or any departure from `Stopped`) bumps the
//! session generation, which orphans every outstanding stage request;
//! their responses are discarded on arrival.

use serde_json::Value;
use tracing::debug;

use rdv_dap::{
    ScopesArguments, ScopesResponseBody, StackTraceArguments, StackTraceResponseBody,
    VariablesArguments, VariablesResponseBody,
};

use crate::sequencer::RequestPurpose;
use crate::session::{DebugSession, SessionNotice, VariableRow};

/// Which stage a pipeline request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    StackTrace,
    Scopes,
    Variables,
}

/// In-flight inspection state for the current stopped thread.
#[derive(Debug)]
pub(super) struct InspectPipeline {
    pub thread_id: u32,
    pub stage: PipelineStage,
}

impl DebugSession {
    /// Start a fresh pipeline for a newly stopped thread, replacing
    /// and invalidating any prior one.
    pub(super) fn start_inspection(&mut self, thread_id: u32) {
        self.generation += 1;
        self.pipeline = Some(InspectPipeline {
            thread_id,
            stage: PipelineStage::StackTrace,
        });
        let args = serde_json::to_value(StackTraceArguments { thread_id }).ok();
        self.send_request(
            "stackTrace",
            args,
            RequestPurpose::Pipeline {
                generation: self.generation,
                stage: PipelineStage::StackTrace,
            },
        );
    }

    /// Feed a pipeline response body into the next stage. The caller
    /// has already checked the generation; a stage mismatch still
    /// means the response is stale noise.
    pub(super) fn advance_inspection(&mut self, stage: PipelineStage, body: Option<Value>) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            debug!(?stage, "pipeline response with no pipeline in flight; discarded");
            return;
        };
        if pipeline.stage != stage {
            debug!(
                ?stage,
                expected = ?pipeline.stage,
                "out-of-order pipeline response; discarded"
            );
            return;
        }

        match stage {
            PipelineStage::StackTrace => self.on_stack_trace(body),
            PipelineStage::Scopes => self.on_scopes(body),
            PipelineStage::Variables => self.on_variables(body),
        }
    }

    fn on_stack_trace(&mut self, body: Option<Value>) {
        let Some(frames) = body
            .and_then(|value| serde_json::from_value::<StackTraceResponseBody>(value).ok())
        else {
            debug!("malformed stackTrace body; pipeline abandoned");
            self.pipeline = None;
            return;
        };
        let Some(top) = frames.stack_frames.first() else {
            debug!("stopped thread has no frames; pipeline abandoned");
            self.pipeline = None;
            return;
        };

        let frame_id = top.id;
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.stage = PipelineStage::Scopes;
        }
        let args = serde_json::to_value(ScopesArguments { frame_id }).ok();
        self.send_request(
            "scopes",
            args,
            RequestPurpose::Pipeline {
                generation: self.generation,
                stage: PipelineStage::Scopes,
            },
        );
    }

    fn on_scopes(&mut self, body: Option<Value>) {
        let Some(scopes) =
            body.and_then(|value| serde_json::from_value::<ScopesResponseBody>(value).ok())
        else {
            debug!("malformed scopes body; pipeline abandoned");
            self.pipeline = None;
            return;
        };

        // A reference of 0 is not expandable; there is nothing to
        // fetch, so publish an empty listing.
        let Some(reference) = scopes
            .scopes
            .first()
            .map(|scope| scope.variables_reference)
            .filter(|reference| *reference != 0)
        else {
            self.pipeline = None;
            self.notify(SessionNotice::VariablesReady(Vec::new()));
            return;
        };

        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.stage = PipelineStage::Variables;
        }
        let args = serde_json::to_value(VariablesArguments {
            variables_reference: reference,
        })
        .ok();
        self.send_request(
            "variables",
            args,
            RequestPurpose::Pipeline {
                generation: self.generation,
                stage: PipelineStage::Variables,
            },
        );
    }

    fn on_variables(&mut self, body: Option<Value>) {
        self.pipeline = None;
        let Some(variables) =
            body.and_then(|value| serde_json::from_value::<VariablesResponseBody>(value).ok())
        else {
            debug!("malformed variables body; pipeline abandoned");
            return;
        };

        let rows = variables
            .variables
            .into_iter()
            .map(|variable| VariableRow {
                name: variable.name,
                value: variable.value,
                type_name: variable
                    .r#type
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();
        self.notify(SessionNotice::VariablesReady(rows));
    }
}
