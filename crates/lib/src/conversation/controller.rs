//! Conversation controller: owns the transcript, issues turns, commits their results.
//!
//! A [`Turn`] is detached from the controller once issued. It streams without borrowing the
//! controller, and its result is handed back through [`ChatController::finish`], which
//! discards results from cancelled or superseded turns before touching the transcript.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::events::ChatEvent;
use super::handle::{Canceller, RequestHandle, TurnGuard};
use super::reducer::{apply_response, complete, fail, TurnPhase, TurnState};
use crate::auth::User;
use crate::error::{
    turn_error_text, ChatError, ErrorKind, ProtocolError, PERSISTENCE_ERROR_TEXT,
};
use crate::history::{
    ChatMessage, Conversation, ExecResult, HistoryApi, HistoryHealth, HistoryMetadata,
    HistoryStatus, Role,
};
use crate::speech::SpeechEvent;
use crate::stream::EventStream;

type EventSender = mpsc::UnboundedSender<ChatEvent>;
type SpeechSender = mpsc::UnboundedSender<SpeechEvent>;

/// Whether the transcript reached the history service after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    /// History is unavailable, or the turn must not be persisted.
    Skipped,
    /// The update was rejected; a notice was added to the displayed messages.
    Failed,
}

/// What [`ChatController::finish`] did with a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Answered {
        conversation_id: String,
        answer: String,
        saved: SaveStatus,
    },
    /// The turn's answer was replaced by an `error` message with this text.
    Failed { message: String, saved: SaveStatus },
    /// The user stopped the turn. Nothing changed.
    Cancelled,
    /// The conversation changed while the turn was streaming. Nothing changed.
    Stale,
}

/// One issued request. Run it with [`Turn::run`] and hand the result to
/// [`ChatController::finish`].
pub struct Turn {
    api: Arc<dyn HistoryApi>,
    handle: RequestHandle,
    guard: TurnGuard,
    epoch: u64,
    conversation_id: Option<String>,
    user_message: ChatMessage,
    request: Vec<ChatMessage>,
    events: Option<EventSender>,
}

/// Result of a finished [`Turn`], not yet applied to the transcript.
///
/// The turn state is kept even when streaming failed: metadata received before the failure
/// still names the conversation the backend created.
pub struct TurnResult {
    handle: RequestHandle,
    epoch: u64,
    conversation_id: Option<String>,
    user_message: ChatMessage,
    state: TurnState,
    error: Option<ChatError>,
}

impl TurnResult {
    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
            || self
                .error
                .as_ref()
                .map_or(false, |e| e.kind() == ErrorKind::UserCancellation)
    }
}

impl Turn {
    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    /// Messages sent with the generate call: the conversation so far (without `error`
    /// entries) followed by the new user message.
    pub fn request(&self) -> &[ChatMessage] {
        &self.request
    }

    pub fn user_message(&self) -> &ChatMessage {
        &self.user_message
    }

    /// Stream the answer until the body ends, an error occurs, or the handle is cancelled.
    /// Loading for this turn is cleared when this returns (or when the future is dropped).
    pub async fn run(self) -> TurnResult {
        let Turn {
            api,
            handle,
            guard,
            epoch,
            conversation_id,
            user_message,
            request,
            events,
        } = self;
        let correlation_id = user_message.inquiry_id.clone().unwrap_or_default();
        let mut state = TurnState::new(correlation_id);

        let outcome = tokio::select! {
            biased;
            _ = handle.cancelled() => Err(ChatError::Cancelled),
            result = drive(
                api.as_ref(),
                &request,
                conversation_id.as_deref(),
                &mut state,
                events.as_ref(),
                &handle,
            ) => result,
        };
        let error = match outcome {
            Ok(()) => {
                log::debug!("turn {} finished streaming", handle.id());
                None
            }
            Err(e) if e.kind() == ErrorKind::UserCancellation => {
                log::debug!("turn {} cancelled", handle.id());
                Some(e)
            }
            Err(e) => {
                log::warn!("turn {} failed: {}", handle.id(), e);
                Some(e)
            }
        };
        drop(guard);

        TurnResult {
            handle,
            epoch,
            conversation_id,
            user_message,
            state,
            error,
        }
    }
}

/// Stream the body into `state`. Whatever was folded in before an error stays in `state`.
async fn drive(
    api: &dyn HistoryApi,
    request: &[ChatMessage],
    conversation_id: Option<&str>,
    state: &mut TurnState,
    events: Option<&EventSender>,
    handle: &RequestHandle,
) -> Result<(), ChatError> {
    let body = api.generate(request, conversation_id).await?;
    let mut stream = EventStream::new(body);
    while let Some(event) = stream.next_event().await {
        let response = event?;
        let before = state.assistant().map_or(0, |a| a.content.len());
        *state = apply_response(std::mem::take(state), &response);
        handle.set_phase(state.phase());
        if let (Some(tx), Some(assistant)) = (events, state.assistant()) {
            if assistant.content.len() > before {
                let _ = tx.send(ChatEvent::AssistantDelta {
                    turn_id: handle.id().to_string(),
                    delta: assistant.content[before..].to_string(),
                });
            }
        }
    }
    state.close();
    Ok(())
}

pub struct ChatController {
    api: Arc<dyn HistoryApi>,
    conversation: Option<Conversation>,
    /// What the user sees: the conversation plus display-only notices.
    messages: Vec<ChatMessage>,
    chat_history: Vec<Conversation>,
    history_available: bool,
    user: User,
    canceller: Canceller,
    events: Option<EventSender>,
    speech: Option<SpeechSender>,
    exec_results: Vec<ExecResult>,
    epoch: u64,
}

impl ChatController {
    pub fn new(api: Arc<dyn HistoryApi>) -> Self {
        Self {
            api,
            conversation: None,
            messages: Vec::new(),
            chat_history: Vec::new(),
            history_available: true,
            user: User::guest(),
            canceller: Canceller::default(),
            events: None,
            speech: None,
            exec_results: Vec::new(),
            epoch: 0,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Forward committed answers and stopped generations to a speech coordinator.
    pub fn with_speech(mut self, speech: SpeechSender) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation.as_ref().map(|c| c.id.as_str())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn chat_history(&self) -> &[Conversation] {
        &self.chat_history
    }

    /// Execution details of the most recent answered turn.
    pub fn exec_results(&self) -> &[ExecResult] {
        &self.exec_results
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn history_available(&self) -> bool {
        self.history_available
    }

    pub fn set_history_available(&mut self, available: bool) {
        self.history_available = available;
    }

    /// Handle for stopping generation from another task.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.canceller.in_flight() > 0
    }

    /// Cancel every in-flight turn.
    pub fn stop_generating(&self) -> usize {
        self.canceller.cancel_all()
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn notify_speech(&self, event: SpeechEvent) {
        if let Some(tx) = &self.speech {
            if tx.send(event).is_err() {
                log::debug!("speech coordinator is gone");
            }
        }
    }

    /// Issue a turn for `question` against the current conversation.
    pub fn begin_turn(&mut self, question: &str) -> Turn {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut user_message = ChatMessage::user(question).with_inquiry(correlation_id);
        if !self.user.is_dummy() {
            user_message.user_name = Some(self.user.fullname.clone());
            user_message.user_email = Some(self.user.email.clone());
        }

        let mut request: Vec<ChatMessage> = self
            .conversation
            .iter()
            .flat_map(|c| c.messages.iter())
            .filter(|m| m.role != Role::Error)
            .cloned()
            .collect();
        request.push(user_message.clone());

        let handle = RequestHandle::new();
        let guard = TurnGuard::new(handle.clone(), self.canceller.clone(), self.events.clone());
        self.emit(ChatEvent::TurnStarted {
            turn_id: handle.id().to_string(),
        });
        log::debug!(
            "turn {} issued ({} messages, conversation {:?})",
            handle.id(),
            request.len(),
            self.conversation_id()
        );

        Turn {
            api: Arc::clone(&self.api),
            handle,
            guard,
            epoch: self.epoch,
            conversation_id: self.conversation_id().map(str::to_string),
            user_message,
            request,
            events: self.events.clone(),
        }
    }

    /// Ask `question`, stream the answer, and commit it.
    pub async fn submit(&mut self, question: &str) -> TurnOutcome {
        let turn = self.begin_turn(question);
        let result = turn.run().await;
        self.finish(result).await
    }

    /// Apply a finished turn to the transcript and persist it.
    ///
    /// Cancelled turns and turns issued against a conversation that is no longer current
    /// change nothing. A committed answer is handed to the speech coordinator, if any.
    pub async fn finish(&mut self, result: TurnResult) -> TurnOutcome {
        let handle = result.handle.clone();
        let outcome = self.apply(result).await;
        handle.set_phase(TurnPhase::NotRunning);
        match &outcome {
            TurnOutcome::Answered { answer, .. } => {
                self.notify_speech(SpeechEvent::TurnCompleted {
                    reply: answer.clone(),
                })
            }
            TurnOutcome::Cancelled => self.notify_speech(SpeechEvent::GenerationStopped),
            _ => {}
        }
        outcome
    }

    async fn apply(&mut self, result: TurnResult) -> TurnOutcome {
        if result.is_cancelled() {
            return TurnOutcome::Cancelled;
        }
        let TurnResult {
            handle,
            epoch,
            conversation_id,
            user_message,
            state,
            error,
        } = result;
        if epoch != self.epoch || conversation_id.as_deref() != self.conversation_id() {
            log::debug!("discarding stale turn {}", handle.id());
            return TurnOutcome::Stale;
        }

        let metadata = state.history_metadata().cloned();
        let (turn_messages, exec_results, error) = match error {
            None => {
                let exec_results = state.exec_results().to_vec();
                match complete(state, &user_message) {
                    Ok(messages) => (messages, exec_results, None),
                    Err(e) => {
                        let e = ChatError::from(e);
                        (fail(&user_message, turn_error_text(&e)), Vec::new(), Some(e))
                    }
                }
            }
            Some(e) => (fail(&user_message, turn_error_text(&e)), Vec::new(), Some(e)),
        };

        let conversation_id = match self.commit(conversation_id, metadata, turn_messages) {
            Some(id) => id,
            None => {
                // A new conversation without an id cannot be stored; show the turn only.
                let error = error.unwrap_or(ChatError::Protocol(ProtocolError::MissingMetadata));
                let message = turn_error_text(&error);
                self.messages.extend(fail(&user_message, message.clone()));
                return TurnOutcome::Failed {
                    message,
                    saved: SaveStatus::Skipped,
                };
            }
        };

        let skip = error.as_ref().map_or(false, ChatError::is_no_content);
        let saved = if skip {
            SaveStatus::Skipped
        } else {
            self.persist().await
        };

        match error {
            None => {
                self.exec_results = exec_results;
                let answer = self
                    .conversation
                    .as_ref()
                    .and_then(|c| c.messages.last())
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                TurnOutcome::Answered {
                    conversation_id,
                    answer,
                    saved,
                }
            }
            Some(e) => TurnOutcome::Failed {
                message: turn_error_text(&e),
                saved,
            },
        }
    }

    /// Append the turn's messages to the current conversation, creating it from the
    /// stream's metadata when the turn started one. Returns `None` when a new conversation
    /// has no id to be stored under.
    fn commit(
        &mut self,
        conversation_id: Option<String>,
        metadata: Option<HistoryMetadata>,
        turn_messages: Vec<ChatMessage>,
    ) -> Option<String> {
        let snapshot = if conversation_id.is_some() {
            let conversation = self.conversation.as_mut()?;
            conversation.messages.extend(turn_messages);
            conversation.clone()
        } else {
            let metadata = metadata?;
            let conversation = Conversation {
                id: metadata.conversation_id,
                title: metadata.title,
                date: metadata.date,
                messages: turn_messages,
            };
            log::info!("started conversation {}", conversation.id);
            self.conversation = Some(conversation.clone());
            conversation
        };
        let id = snapshot.id.clone();
        self.messages = snapshot.messages.clone();
        self.remember(snapshot);
        self.emit(ChatEvent::Committed {
            conversation_id: id.clone(),
        });
        Some(id)
    }

    /// Keep the history sidebar copy in step with the current conversation.
    fn remember(&mut self, conversation: Conversation) {
        match self.chat_history.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.chat_history.insert(0, conversation),
        }
    }

    /// Push the full transcript of the current conversation.
    async fn persist(&mut self) -> SaveStatus {
        if !self.history_available {
            return SaveStatus::Skipped;
        }
        let Some(conversation) = self.conversation.as_ref() else {
            return SaveStatus::Skipped;
        };
        let id = conversation.id.clone();
        let messages = conversation.messages.clone();
        let api = Arc::clone(&self.api);
        match api.update(&messages, &id).await {
            Ok(()) => {
                self.emit(ChatEvent::Saved {
                    conversation_id: id,
                });
                SaveStatus::Saved
            }
            Err(e) => {
                log::warn!("could not save conversation {}: {}", id, e);
                self.messages.push(ChatMessage::error(PERSISTENCE_ERROR_TEXT));
                self.emit(ChatEvent::SaveFailed {
                    conversation_id: id,
                });
                SaveStatus::Failed
            }
        }
    }

    /// Drop the current conversation and start an empty one. In-flight turns are cancelled.
    pub fn new_chat(&mut self) {
        self.reset_turns();
        self.conversation = None;
        self.messages.clear();
        self.exec_results.clear();
    }

    fn reset_turns(&mut self) {
        let cancelled = self.canceller.cancel_all();
        if cancelled > 0 {
            log::debug!("cancelled {} in-flight turn(s)", cancelled);
        }
        self.epoch += 1;
    }

    /// Make a stored conversation current, reading its messages if they are not cached.
    pub async fn load_conversation(&mut self, conversation_id: &str) -> Result<(), ChatError> {
        let cached = self
            .chat_history
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned();
        let conversation = match cached {
            Some(c) if !c.messages.is_empty() => c,
            cached => {
                let messages = self.api.read(conversation_id).await?;
                let (title, date) = cached.map(|c| (c.title, c.date)).unwrap_or_default();
                Conversation {
                    id: conversation_id.to_string(),
                    title,
                    date,
                    messages,
                }
            }
        };
        self.reset_turns();
        self.messages = conversation.messages.clone();
        self.exec_results.clear();
        self.conversation = Some(conversation.clone());
        self.remember(conversation);
        Ok(())
    }

    /// Remove every message of the current conversation, keeping the conversation itself.
    pub async fn clear_chat(&mut self) -> Result<(), ChatError> {
        let Some(id) = self.conversation_id().map(str::to_string) else {
            self.new_chat();
            return Ok(());
        };
        if self.history_available {
            self.api.clear(&id).await?;
        }
        self.reset_turns();
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.messages.clear();
            let snapshot = conversation.clone();
            self.remember(snapshot);
        }
        self.messages.clear();
        self.exec_results.clear();
        Ok(())
    }

    /// Record feedback for an assistant message, locally and on the backend.
    pub async fn set_feedback(
        &mut self,
        message_id: &str,
        feedback: &str,
    ) -> Result<(), ChatError> {
        self.api.message_feedback(message_id, feedback).await?;
        let apply = |messages: &mut Vec<ChatMessage>| {
            for m in messages.iter_mut().filter(|m| m.id == message_id) {
                m.feedback = Some(feedback.to_string());
            }
        };
        apply(&mut self.messages);
        if let Some(conversation) = self.conversation.as_mut() {
            apply(&mut conversation.messages);
        }
        for conversation in self.chat_history.iter_mut() {
            apply(&mut conversation.messages);
        }
        Ok(())
    }

    /// Reload the conversation list from the backend.
    pub async fn refresh_history(&mut self) -> Result<&[Conversation], ChatError> {
        if self.history_available {
            self.chat_history = self.api.list(0).await?;
        }
        Ok(&self.chat_history)
    }

    /// Probe the history service and enable or disable persistence accordingly.
    pub async fn check_history(&mut self) -> HistoryHealth {
        let health = self.api.ensure().await;
        self.history_available = health.available && health.status == HistoryStatus::Working;
        if !self.history_available {
            log::warn!("chat history unavailable: {}", health.status);
        }
        health
    }
}
