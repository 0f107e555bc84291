//! Per-turn reconciliation of stream fragments into transcript entries.
//!
//! All state for one turn lives in [`TurnState`], which is passed into and returned from
//! [`reduce`]; nothing is shared between turns.

use crate::error::ProtocolError;
use crate::history::{
    now_iso, ChatMessage, ChatResponse, ExecResult, ExecResultsEnvelope, HistoryMetadata, Role,
};

/// Where one generate call is in its life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    NotRunning,
    Processing,
    Done,
}

/// One decoded message of a server event, stamped with the event id and arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFragment {
    pub role: Role,
    pub content: String,
    pub id: String,
    pub date: String,
    pub context: Option<String>,
}

impl StreamFragment {
    /// Fragments of the first choice of `response`, in order.
    pub fn from_response(response: &ChatResponse) -> Vec<StreamFragment> {
        let date = now_iso();
        response
            .choices
            .first()
            .map(|choice| {
                choice
                    .messages
                    .iter()
                    .map(|m| StreamFragment {
                        role: m.role,
                        content: m.content.clone(),
                        id: response.id.clone(),
                        date: date.clone(),
                        context: m.context.clone().filter(|c| !c.is_empty()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Everything accumulated for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    correlation_id: String,
    phase: TurnPhase,
    assistant: Option<ChatMessage>,
    tool: Option<ChatMessage>,
    exec_results: Vec<ExecResult>,
    history_metadata: Option<HistoryMetadata>,
}

impl TurnState {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::default()
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn assistant(&self) -> Option<&ChatMessage> {
        self.assistant.as_ref()
    }

    pub fn tool(&self) -> Option<&ChatMessage> {
        self.tool.as_ref()
    }

    pub fn exec_results(&self) -> &[ExecResult] {
        &self.exec_results
    }

    pub fn history_metadata(&self) -> Option<&HistoryMetadata> {
        self.history_metadata.as_ref()
    }

    /// The response body has been fully read.
    pub fn close(&mut self) {
        self.phase = TurnPhase::Done;
    }
}

/// Fold one server event into the turn: record conversation metadata, then every fragment.
pub fn apply_response(mut state: TurnState, response: &ChatResponse) -> TurnState {
    state.phase = TurnPhase::Processing;
    if let Some(meta) = &response.history_metadata {
        state.history_metadata = Some(meta.clone());
    }
    StreamFragment::from_response(response)
        .into_iter()
        .fold(state, reduce)
}

/// Merge one fragment.
///
/// Assistant content accumulates across fragments. An embedded context blob becomes the
/// turn's tool message; a `tool` fragment replaces it outright.
pub fn reduce(mut state: TurnState, fragment: StreamFragment) -> TurnState {
    state.phase = TurnPhase::Processing;
    if fragment.content.contains("all_exec_results") {
        match serde_json::from_str::<ExecResultsEnvelope>(&fragment.content) {
            Ok(envelope) => state.exec_results = envelope.all_exec_results,
            Err(e) => log::debug!("fragment mentions exec results but does not parse: {}", e),
        }
    }
    match fragment.role {
        Role::Assistant => {
            let mut assistant = state.assistant.take().unwrap_or_else(|| ChatMessage {
                id: fragment.id.clone(),
                date: fragment.date.clone(),
                ..ChatMessage::new(Role::Assistant, String::new())
            });
            assistant.content.push_str(&fragment.content);
            assistant.inquiry_id = Some(state.correlation_id.clone());
            state.assistant = Some(assistant);

            if let Some(context) = fragment.context {
                let unchanged = state.tool.as_ref().map_or(false, |t| t.content == context);
                if !unchanged {
                    let tool = ChatMessage::new(Role::Tool, context)
                        .with_inquiry(state.correlation_id.clone());
                    state.tool = Some(tool);
                }
            }
        }
        Role::Tool => {
            let tool = ChatMessage {
                id: fragment.id,
                date: fragment.date,
                ..ChatMessage::new(Role::Tool, fragment.content)
            }
            .with_inquiry(state.correlation_id.clone());
            state.tool = Some(tool);
        }
        other => log::debug!("ignoring {:?} fragment in response stream", other),
    }
    state
}

/// Messages the finished turn appends to the transcript: the user message that started it,
/// then the tool message (if any), then the assistant answer. Tool always precedes the
/// answer, whatever order the fragments arrived in.
///
/// A turn that never produced an assistant fragment is a protocol failure.
pub fn complete(
    mut state: TurnState,
    user_message: &ChatMessage,
) -> Result<Vec<ChatMessage>, ProtocolError> {
    let assistant = state.assistant.take().ok_or(ProtocolError::NoContent)?;
    if assistant.content.is_empty() {
        return Err(ProtocolError::NoContent);
    }
    let mut out = Vec::with_capacity(3);
    out.push(user_message.clone());
    out.extend(state.tool.take());
    out.push(assistant);
    Ok(out)
}

/// Messages a failed turn appends: the user message and one `error` entry standing in for
/// the missing tool/assistant pair.
pub fn fail(user_message: &ChatMessage, error_text: impl Into<String>) -> Vec<ChatMessage> {
    vec![user_message.clone(), ChatMessage::error(error_text)]
}
