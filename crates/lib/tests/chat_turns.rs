//! Integration test: full chat turns against an in-memory history backend.
//! Covers commit order, cancellation, stale turns, and persistence decisions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use hrchat::auth::User;
use hrchat::config::SpeechConfig;
use hrchat::conversation::{ChatController, ChatEvent, SaveStatus, TurnOutcome, TurnPhase};
use hrchat::error::{ChatError, PERSISTENCE_ERROR_TEXT};
use hrchat::history::{
    ByteStream, ChatMessage, HistoryApi, HistoryHealth, HistoryStatus, Role,
};
use hrchat::speech::{
    Avatar, Recognizer, RecognizerEvent, SpeechCoordinator, SpeechDriver, SpeechEffect,
    SpeechEvent, TokenSource,
};
use serde_json::json;
use tokio::sync::mpsc;

enum Script {
    /// Body delivered in the given chunks, then closed.
    Body(Vec<Vec<u8>>),
    /// Body delivered, then the connection hangs.
    Stall(Vec<Vec<u8>>),
    /// Body delivered, then the connection breaks.
    Break(Vec<Vec<u8>>, ChatError),
    Fail(ChatError),
}

#[derive(Default)]
struct FakeHistory {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, Option<String>)>>,
    updates: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    feedback: Mutex<Vec<(String, String)>>,
    reject_updates: bool,
    status: Option<HistoryStatus>,
}

impl FakeHistory {
    fn with(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    fn updates(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.updates.lock().unwrap().clone()
    }

    fn requests(&self) -> Vec<(Vec<ChatMessage>, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        conversation_id: Option<&str>,
    ) -> Result<ByteStream, ChatError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), conversation_id.map(str::to_string)));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected generate call");
        match script {
            Script::Body(chunks) => {
                Ok(stream::iter(chunks.into_iter().map(Ok::<_, ChatError>)).boxed())
            }
            Script::Stall(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok::<_, ChatError>))
                .chain(stream::pending())
                .boxed()),
            Script::Break(chunks, e) => Ok(stream::iter(chunks.into_iter().map(Ok::<_, ChatError>))
                .chain(stream::iter([Err(e)]))
                .boxed()),
            Script::Fail(e) => Err(e),
        }
    }

    async fn update(
        &self,
        messages: &[ChatMessage],
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        if self.reject_updates {
            return Err(ChatError::Persistence("database unavailable".to_string()));
        }
        self.updates
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn ensure(&self) -> HistoryHealth {
        let status = self.status.clone().unwrap_or(HistoryStatus::Working);
        HistoryHealth {
            available: status == HistoryStatus::Working,
            status,
        }
    }

    async fn message_feedback(&self, message_id: &str, feedback: &str) -> Result<(), ChatError> {
        self.feedback
            .lock()
            .unwrap()
            .push((message_id.to_string(), feedback.to_string()));
        Ok(())
    }
}

fn line(value: serde_json::Value) -> String {
    format!("{}\n", value)
}

fn assistant(id: &str, content: &str) -> String {
    line(json!({"id": id, "choices": [{"messages": [{"role": "assistant", "content": content}]}]}))
}

fn assistant_with_meta(id: &str, content: &str, conversation_id: &str) -> String {
    line(json!({
        "id": id,
        "choices": [{"messages": [{"role": "assistant", "content": content}]}],
        "history_metadata": {"conversation_id": conversation_id, "title": "PTO", "date": "2024-05-01T10:00:00"}
    }))
}

fn tool(id: &str) -> String {
    let citations = json!({"citations": [{"content": "Employees accrue PTO monthly.", "id": "doc-1", "title": "Handbook"}]});
    line(json!({"id": id, "choices": [{"messages": [{"role": "tool", "content": citations.to_string()}]}]}))
}

/// Split the concatenated body into fixed-size chunks, ignoring line boundaries.
fn chunked(lines: &[String], size: usize) -> Vec<Vec<u8>> {
    lines.concat().into_bytes().chunks(size).map(<[u8]>::to_vec).collect()
}

fn answer_script(conversation_id: &str) -> Script {
    Script::Body(chunked(
        &[
            assistant_with_meta("r1", "You have ", conversation_id),
            assistant("r1", "15 days."),
            tool("r1"),
        ],
        7,
    ))
}

fn roles(messages: &[ChatMessage]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn loading_finished(events: &[ChatEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ChatEvent::LoadingFinished { .. }))
        .count()
}

#[tokio::test]
async fn new_conversation_commits_tool_before_assistant() {
    let api = Arc::new(FakeHistory::with(vec![answer_script("c-1")]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(api.clone()).with_events(tx);

    let outcome = controller.submit("How much PTO do I get?").await;
    assert_eq!(
        outcome,
        TurnOutcome::Answered {
            conversation_id: "c-1".to_string(),
            answer: "You have 15 days.".to_string(),
            saved: SaveStatus::Saved,
        }
    );

    let conversation = controller.conversation().expect("conversation created");
    assert_eq!(conversation.id, "c-1");
    assert_eq!(conversation.title, "PTO");
    assert_eq!(
        roles(&conversation.messages),
        vec![Role::User, Role::Tool, Role::Assistant]
    );
    let inquiry = conversation.messages[0].inquiry_id.clone();
    assert!(inquiry.is_some());
    assert_eq!(conversation.messages[1].inquiry_id, inquiry);
    assert_eq!(conversation.messages[2].inquiry_id, inquiry);
    assert_eq!(controller.chat_history().len(), 1);

    let updates = api.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "c-1");
    assert_eq!(updates[0].1, conversation.messages);

    let events = drain(&mut rx);
    assert_eq!(loading_finished(&events), 1);
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::AssistantDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "You have 15 days.");
    assert!(!controller.is_loading());
}

#[tokio::test]
async fn every_update_resends_the_full_transcript_and_requests_skip_errors() {
    let api = Arc::new(FakeHistory::with(vec![
        answer_script("c-1"),
        Script::Body(vec![line(json!({"error": "model overloaded"})).into_bytes()]),
        Script::Body(vec![assistant("r3", "Yes.").into_bytes()]),
    ]));
    let mut controller = ChatController::new(api.clone());

    controller.submit("How much PTO do I get?").await;
    let failed = controller.submit("Can I carry it over?").await;
    assert_eq!(
        failed,
        TurnOutcome::Failed {
            message: "model overloaded".to_string(),
            saved: SaveStatus::Saved,
        }
    );
    let answered = controller.submit("Really?").await;
    assert!(matches!(answered, TurnOutcome::Answered { .. }));

    let updates = api.updates();
    let sizes: Vec<usize> = updates.iter().map(|(_, m)| m.len()).collect();
    assert_eq!(sizes, vec![3, 5, 7]);
    for pair in updates.windows(2) {
        assert_eq!(pair[1].1[..pair[0].1.len()], pair[0].1[..]);
    }
    assert_eq!(
        roles(&updates[1].1[3..]),
        vec![Role::User, Role::Error]
    );

    let requests = api.requests();
    assert_eq!(requests[0].1, None);
    assert_eq!(requests[1].1.as_deref(), Some("c-1"));
    let (third, _) = &requests[2];
    assert_eq!(third.len(), 5);
    assert!(third.iter().all(|m| m.role != Role::Error));
    assert_eq!(third.last().map(|m| m.content.as_str()), Some("Really?"));
}

#[tokio::test]
async fn cancel_before_close_leaves_transcript_untouched() {
    let api = Arc::new(FakeHistory::with(vec![Script::Stall(vec![
        assistant_with_meta("r1", "You have", "c-1").into_bytes(),
    ])]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(api.clone()).with_events(tx);

    let turn = controller.begin_turn("How much PTO do I get?");
    let task = tokio::spawn(turn.run());
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ChatEvent::AssistantDelta { .. })) => break,
            Ok(Some(_)) => continue,
            other => panic!("no streamed text before timeout: {:?}", other),
        }
    }
    assert!(controller.is_loading());
    assert_eq!(controller.canceller().cancel_all(), 1);
    // Cancelling twice is harmless.
    controller.stop_generating();

    let result = task.await.expect("turn task");
    assert!(result.is_cancelled());
    assert_eq!(controller.finish(result).await, TurnOutcome::Cancelled);

    assert!(controller.conversation().is_none());
    assert!(controller.messages().is_empty());
    assert!(api.updates().is_empty());
    assert!(!controller.is_loading());
    assert_eq!(loading_finished(&drain(&mut rx)), 1);
}

#[tokio::test]
async fn turn_issued_before_conversation_changed_is_stale() {
    let api = Arc::new(FakeHistory::with(vec![
        answer_script("c-1"),
        answer_script("c-2"),
    ]));
    let mut controller = ChatController::new(api.clone());

    let first = controller.begin_turn("first question");
    let second = controller.begin_turn("second question");

    let result = second.run().await;
    assert!(matches!(
        controller.finish(result).await,
        TurnOutcome::Answered { .. }
    ));

    let result = first.run().await;
    assert_eq!(controller.finish(result).await, TurnOutcome::Stale);

    let conversation = controller.conversation().unwrap();
    assert_eq!(conversation.id, "c-1");
    assert_eq!(conversation.messages.len(), 3);
    assert_eq!(conversation.messages[0].content, "second question");
    assert_eq!(api.updates().len(), 1);
}

#[tokio::test]
async fn new_chat_cancels_in_flight_turn() {
    let api = Arc::new(FakeHistory::with(vec![Script::Stall(Vec::new())]));
    let mut controller = ChatController::new(api);

    let turn = controller.begin_turn("question");
    let task = tokio::spawn(turn.run());
    controller.new_chat();
    let result = task.await.expect("turn task");
    assert_eq!(controller.finish(result).await, TurnOutcome::Cancelled);
    assert!(controller.messages().is_empty());
}

#[tokio::test]
async fn empty_answer_is_shown_but_not_saved() {
    let api = Arc::new(FakeHistory::with(vec![
        answer_script("c-1"),
        Script::Body(vec![assistant("r2", "").into_bytes()]),
    ]));
    let mut controller = ChatController::new(api.clone());

    controller.submit("How much PTO do I get?").await;
    let outcome = controller.submit("And sick leave?").await;
    match outcome {
        TurnOutcome::Failed { message, saved } => {
            assert!(message.contains("No content in messages object."));
            assert_eq!(saved, SaveStatus::Skipped);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(
        roles(controller.messages()),
        vec![Role::User, Role::Tool, Role::Assistant, Role::User, Role::Error]
    );
    assert_eq!(api.updates().len(), 1);
}

#[tokio::test]
async fn rejected_update_adds_notice_without_losing_transcript() {
    let api = Arc::new(FakeHistory {
        reject_updates: true,
        ..FakeHistory::with(vec![answer_script("c-1")])
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(api).with_events(tx);

    let outcome = controller.submit("How much PTO do I get?").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Answered {
            saved: SaveStatus::Failed,
            ..
        }
    ));
    assert_eq!(controller.conversation().unwrap().messages.len(), 3);
    let last = controller.messages().last().unwrap();
    assert_eq!(last.role, Role::Error);
    assert_eq!(last.content, PERSISTENCE_ERROR_TEXT);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::SaveFailed { .. })));
}

#[tokio::test]
async fn new_conversation_without_metadata_is_display_only() {
    let api = Arc::new(FakeHistory::with(vec![Script::Body(vec![assistant(
        "r1", "Hello",
    )
    .into_bytes()])]));
    let mut controller = ChatController::new(api.clone());

    let outcome = controller.submit("Hi").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            saved: SaveStatus::Skipped,
            ..
        }
    ));
    assert!(controller.conversation().is_none());
    assert_eq!(roles(controller.messages()), vec![Role::User, Role::Error]);
    assert!(api.updates().is_empty());
}

#[tokio::test]
async fn transport_failure_becomes_error_message() {
    let api = Arc::new(FakeHistory::with(vec![Script::Fail(ChatError::Api {
        status: 500,
        message: "upstream down".to_string(),
    })]));
    let mut controller = ChatController::new(api);

    match controller.submit("Hi").await {
        TurnOutcome::Failed { message, .. } => {
            assert!(message.starts_with("There was an error generating a response."));
            assert!(message.ends_with("upstream down"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!controller.is_loading());
}

#[tokio::test]
async fn unavailable_history_skips_persistence() {
    let api = Arc::new(FakeHistory {
        status: Some(HistoryStatus::NotConfigured),
        ..FakeHistory::with(vec![answer_script("c-1")])
    });
    let mut controller = ChatController::new(api.clone());

    let health = controller.check_history().await;
    assert_eq!(health.status, HistoryStatus::NotConfigured);
    assert!(!controller.history_available());
    assert!(matches!(
        controller.submit("Hi").await,
        TurnOutcome::Answered {
            saved: SaveStatus::Skipped,
            ..
        }
    ));
    assert!(api.updates().is_empty());
}

#[tokio::test]
async fn user_identity_is_stamped_and_feedback_recorded() {
    let api = Arc::new(FakeHistory::with(vec![answer_script("c-1")]));
    let user = User {
        fullname: "Jane Doe".to_string(),
        firstname: "Jane".to_string(),
        email: "jane.doe@corp.com".to_string(),
        preferred_username: "jdoe@corp.com".to_string(),
    };
    let mut controller = ChatController::new(api.clone()).with_user(user);

    controller.submit("How much PTO do I get?").await;
    let requests = api.requests();
    let (sent, _) = &requests[0];
    assert_eq!(sent[0].user_name.as_deref(), Some("Jane Doe"));
    assert_eq!(sent[0].user_email.as_deref(), Some("jane.doe@corp.com"));

    let answer_id = controller.messages()[2].id.clone();
    controller.set_feedback(&answer_id, "positive").await.unwrap();
    assert_eq!(controller.messages()[2].feedback.as_deref(), Some("positive"));
    assert_eq!(
        api.feedback.lock().unwrap()[0],
        (answer_id, "positive".to_string())
    );
}

#[tokio::test]
async fn server_error_after_metadata_still_creates_and_saves_conversation() {
    let api = Arc::new(FakeHistory::with(vec![
        Script::Body(chunked(
            &[
                assistant_with_meta("r1", "You have ", "c-1"),
                line(json!({"error": "model overloaded"})),
            ],
            9,
        )),
        answer_script("c-1"),
    ]));
    let mut controller = ChatController::new(api.clone());

    let outcome = controller.submit("How much PTO do I get?").await;
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            message: "model overloaded".to_string(),
            saved: SaveStatus::Saved,
        }
    );
    assert_eq!(controller.conversation_id(), Some("c-1"));
    assert_eq!(roles(controller.messages()), vec![Role::User, Role::Error]);
    assert_eq!(controller.chat_history().len(), 1);

    let updates = api.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "c-1");
    assert_eq!(roles(&updates[0].1), vec![Role::User, Role::Error]);

    // The follow-up continues the same conversation and leaves the error out.
    controller.submit("And sick leave?").await;
    let requests = api.requests();
    let (sent, conversation_id) = &requests[1];
    assert_eq!(conversation_id.as_deref(), Some("c-1"));
    assert_eq!(roles(sent), vec![Role::User, Role::User]);
    assert_eq!(controller.chat_history().len(), 1);
}

#[tokio::test]
async fn broken_body_after_metadata_keeps_conversation() {
    let api = Arc::new(FakeHistory::with(vec![Script::Break(
        vec![assistant_with_meta("r1", "You have ", "c-1").into_bytes()],
        ChatError::Transport("connection reset".to_string()),
    )]));
    let mut controller = ChatController::new(api.clone());

    match controller.submit("How much PTO do I get?").await {
        TurnOutcome::Failed { message, saved } => {
            assert!(message.starts_with("An error occurred."));
            assert_eq!(saved, SaveStatus::Saved);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(controller.conversation_id(), Some("c-1"));
    assert_eq!(api.updates().len(), 1);
}

#[tokio::test]
async fn no_content_mid_stream_creates_conversation_without_saving() {
    let api = Arc::new(FakeHistory::with(vec![Script::Body(chunked(
        &[
            assistant_with_meta("r1", "You have ", "c-1"),
            assistant("r1", ""),
            assistant("r1", "15 days."),
        ],
        5,
    ))]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(api.clone()).with_events(tx);

    match controller.submit("How much PTO do I get?").await {
        TurnOutcome::Failed { message, saved } => {
            assert!(message.contains("No content in messages object."));
            assert_eq!(saved, SaveStatus::Skipped);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    let conversation = controller.conversation().expect("conversation created");
    assert_eq!(conversation.id, "c-1");
    assert_eq!(roles(&conversation.messages), vec![Role::User, Role::Error]);
    assert!(api.updates().is_empty());

    let streamed: String = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ChatEvent::AssistantDelta { delta, .. } => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "You have ");
}

#[tokio::test]
async fn request_phase_returns_to_not_running_after_commit() {
    let api = Arc::new(FakeHistory::with(vec![answer_script("c-1")]));
    let mut controller = ChatController::new(api);

    let turn = controller.begin_turn("How much PTO do I get?");
    let handle = turn.handle().clone();
    assert_eq!(handle.phase(), TurnPhase::NotRunning);
    let result = turn.run().await;
    assert_eq!(handle.phase(), TurnPhase::Done);
    assert_eq!(result.state().phase(), TurnPhase::Done);
    assert!(result.error().is_none());

    controller.finish(result).await;
    assert_eq!(handle.phase(), TurnPhase::NotRunning);
}

#[tokio::test]
async fn committed_answer_and_stopped_generation_reach_speech() {
    let api = Arc::new(FakeHistory::with(vec![
        answer_script("c-1"),
        Script::Stall(Vec::new()),
    ]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = ChatController::new(api).with_speech(tx);

    controller.submit("How much PTO do I get?").await;
    let event = rx.try_recv().expect("turn completed");
    assert_eq!(
        event,
        SpeechEvent::TurnCompleted {
            reply: "You have 15 days.".to_string()
        }
    );
    let mut coordinator = SpeechCoordinator::new(&SpeechConfig {
        avatar_enabled: true,
        speech_to_speech: true,
    });
    assert_eq!(
        coordinator.handle(event),
        vec![SpeechEffect::Speak("You have 15 days.".to_string())]
    );

    let turn = controller.begin_turn("And sick leave?");
    let task = tokio::spawn(turn.run());
    controller.stop_generating();
    let result = task.await.expect("turn task");
    assert_eq!(controller.finish(result).await, TurnOutcome::Cancelled);
    assert_eq!(rx.try_recv().ok(), Some(SpeechEvent::GenerationStopped));
    assert!(rx.try_recv().is_err());
}

/// Recognizer that is never used: without speech-to-speech the microphone stays idle.
struct IdleRecognizer;

#[async_trait]
impl Recognizer for IdleRecognizer {
    async fn connect(&mut self, _token: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RecognizerEvent> {
        None
    }

    async fn close(&mut self) {}
}

struct RecordingAvatar {
    spoken: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Avatar for RecordingAvatar {
    async fn speak(&mut self, text: &str) -> Result<(), ChatError> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn stop(&mut self) {}
}

struct NoTokens;

#[async_trait]
impl TokenSource for NoTokens {
    async fn fetch_token(&self) -> Result<String, ChatError> {
        Err(ChatError::Auth("no speech service".to_string()))
    }
}

#[tokio::test]
async fn avatar_speaks_each_committed_answer() {
    let api = Arc::new(FakeHistory::with(vec![answer_script("c-1")]));
    let spoken = Arc::new(Mutex::new(Vec::new()));
    let driver = SpeechDriver::new(
        &SpeechConfig {
            avatar_enabled: true,
            speech_to_speech: false,
        },
        IdleRecognizer,
        RecordingAvatar {
            spoken: spoken.clone(),
        },
        NoTokens,
    );
    let (speech_tx, speech_rx) = mpsc::unbounded_channel();
    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(driver.run(speech_rx, host_tx));

    let mut controller = ChatController::new(api).with_speech(speech_tx);
    controller.submit("How much PTO do I get?").await;
    drop(controller);

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("speech driver stops with the controller")
        .expect("speech task");
    assert_eq!(*spoken.lock().unwrap(), vec!["You have 15 days.".to_string()]);
    assert!(host_rx.try_recv().is_err());
}
