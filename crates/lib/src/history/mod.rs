//! History service: wire types and the HTTP client for `/history/*`.

mod client;
mod models;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::ChatError;

pub use client::{FrontendSettings, HistoryClient};
pub use models::{
    now_iso, parse_citations, ChatChoice, ChatMessage, ChatResponse, Citation, Conversation,
    ExecResult, HistoryHealth, HistoryMetadata, HistoryStatus, ResponseMessage, Role,
    ToolMessageContent, UserClaim, UserInfo,
};
pub(crate) use models::ExecResultsEnvelope;

/// Raw body of a generate response, chunked however the transport delivers it.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ChatError>>;

/// Operations the conversation core needs from the history backend.
///
/// [`HistoryClient`] is the HTTP implementation; tests substitute in-memory fakes.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Start a streamed answer for `messages`. Without `conversation_id` the backend
    /// creates a conversation and reports it in the stream's `history_metadata`.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        conversation_id: Option<&str>,
    ) -> Result<ByteStream, ChatError>;

    /// Replace the stored transcript with `messages` (always the full list).
    async fn update(&self, messages: &[ChatMessage], conversation_id: &str)
        -> Result<(), ChatError>;

    async fn ensure(&self) -> HistoryHealth;

    async fn list(&self, _offset: usize) -> Result<Vec<Conversation>, ChatError> {
        Err(ChatError::Transport("list not supported".to_string()))
    }

    async fn read(&self, _conversation_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        Err(ChatError::Transport("read not supported".to_string()))
    }

    async fn clear(&self, _conversation_id: &str) -> Result<(), ChatError> {
        Err(ChatError::Transport("clear not supported".to_string()))
    }

    async fn delete(&self, _conversation_id: &str) -> Result<(), ChatError> {
        Err(ChatError::Transport("delete not supported".to_string()))
    }

    async fn delete_all(&self) -> Result<(), ChatError> {
        Err(ChatError::Transport("delete_all not supported".to_string()))
    }

    async fn rename(&self, _conversation_id: &str, _title: &str) -> Result<(), ChatError> {
        Err(ChatError::Transport("rename not supported".to_string()))
    }

    async fn message_feedback(&self, _message_id: &str, _feedback: &str) -> Result<(), ChatError> {
        Err(ChatError::Transport("feedback not supported".to_string()))
    }
}
