//! Speech input and avatar output side channels.
//!
//! The recognizer, the avatar and the token endpoint are external collaborators behind
//! traits; [`SpeechCoordinator`] decides when each is used and [`SpeechDriver`] runs it.

mod coordinator;
mod driver;

use async_trait::async_trait;

use crate::error::ChatError;
use crate::history::HistoryClient;

pub use coordinator::{
    CancelReason, MicState, RecognizerEvent, SpeechCoordinator, SpeechEffect, SpeechEvent,
    MAX_TOKEN_RETRIES,
};
pub use driver::{recognized_question, SpeechDriver};

/// A speech-to-text session.
#[async_trait]
pub trait Recognizer: Send {
    /// Open a recognition session with `token`. Session callbacks are delivered through
    /// [`next_event`](Recognizer::next_event); a rejected token shows up there as
    /// [`CancelReason::ConnectionFailure`].
    async fn connect(&mut self, token: &str) -> Result<(), ChatError>;

    /// Next session callback, or `None` once the session is gone.
    async fn next_event(&mut self) -> Option<RecognizerEvent>;

    async fn close(&mut self);
}

/// Talking-avatar speech synthesis.
#[async_trait]
pub trait Avatar: Send {
    /// Speak `text`. Resolves when speech has ended or was interrupted.
    async fn speak(&mut self, text: &str) -> Result<(), ChatError>;

    async fn stop(&mut self);
}

/// Issues short-lived speech service tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, ChatError>;
}

#[async_trait]
impl TokenSource for HistoryClient {
    async fn fetch_token(&self) -> Result<String, ChatError> {
        self.speech_token().await
    }
}
