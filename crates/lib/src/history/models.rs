//! Transcript and wire types shared by the history API and the conversation core.

use serde::{Deserialize, Serialize};

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Retrieval context (citations) for the assistant answer that follows it.
    Tool,
    /// Synthetic, client-side failure notice. Never sent back to the model.
    Error,
}

/// One transcript entry. Only `feedback` changes after the message is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// ISO 8601 timestamp. The history service reports it as `createdAt`.
    #[serde(default, alias = "createdAt")]
    pub date: String,
    /// Correlation id tying a user message to the tool/assistant messages it produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inquiry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Embedded citation container sent alongside assistant deltas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_turn: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            date: now_iso(),
            inquiry_id: None,
            feedback: None,
            context: None,
            end_turn: None,
            user_name: None,
            user_email: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }

    pub fn with_inquiry(mut self, inquiry_id: impl Into<String>) -> Self {
        self.inquiry_id = Some(inquiry_id.into());
        self
    }
}

/// Current time in the RFC 3339 form the history service stores.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A titled, ordered transcript persisted by the history service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub date: String,
    pub messages: Vec<ChatMessage>,
}

/// One server event of a generate stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub history_metadata: Option<HistoryMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub messages: Vec<ResponseMessage>,
}

/// Message as it appears inside a stream event, before the client stamps id and date.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub end_turn: Option<bool>,
}

/// Conversation identity assigned by the backend when a generate call starts a new conversation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub date: String,
}

/// Parsed content of a `tool` message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolMessageContent {
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub reindex_id: Option<String>,
    #[serde(default)]
    pub part_index: Option<u32>,
}

/// Citations carried by a tool message. Anything that does not parse yields none.
pub fn parse_citations(message: &ChatMessage) -> Vec<Citation> {
    if message.role != Role::Tool {
        return Vec::new();
    }
    match serde_json::from_str::<ToolMessageContent>(&message.content) {
        Ok(content) => content.citations,
        Err(e) => {
            log::debug!("tool message {} has no citation container: {}", message.id, e);
            Vec::new()
        }
    }
}

/// Side record describing how the backend answered (intent, generated query, etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    #[serde(default)]
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_generated: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecResultsEnvelope {
    pub all_exec_results: Vec<ExecResult>,
}

/// Health of the history service as reported by `GET /history/ensure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    Working,
    NotWorking,
    NotConfigured,
    InvalidCredentials,
    /// Any other reason reported by the backend (or a transport failure).
    Other(String),
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryStatus::Working => write!(f, "chat history is configured and working"),
            HistoryStatus::NotWorking => write!(f, "chat history is configured but not working"),
            HistoryStatus::NotConfigured => write!(f, "chat history database is not configured"),
            HistoryStatus::InvalidCredentials => {
                write!(f, "chat history is configured but credentials are invalid")
            }
            HistoryStatus::Other(reason) => write!(f, "{}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryHealth {
    /// True when the probe returned a success status; persistence is attempted only then.
    pub available: bool,
    pub status: HistoryStatus,
}

/// One identity claim set returned by `GET /.auth/me`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_on: String,
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub user_claims: Vec<UserClaim>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaim {
    pub typ: String,
    pub val: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_message_reads_created_at() {
        let m: ChatMessage = serde_json::from_str(
            r#"{"id":"m1","role":"assistant","content":"hi","createdAt":"2024-05-01T10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.date, "2024-05-01T10:00:00");
        assert!(m.feedback.is_none());
    }

    #[test]
    fn optional_fields_are_not_serialized() {
        let json = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("feedback").is_none());
        assert!(json.get("inquiry_id").is_none());
    }

    #[test]
    fn citations_from_tool_message() {
        let mut tool = ChatMessage::new(
            Role::Tool,
            r#"{"citations":[{"content":"PTO policy","id":"1","title":"Handbook","url":"https://intranet/pto"}],"intent":"[\"pto\"]"}"#,
        );
        let citations = parse_citations(&tool);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].title.as_deref(), Some("Handbook"));

        tool.content = "not json".to_string();
        assert!(parse_citations(&tool).is_empty());
    }

    #[test]
    fn citations_ignored_for_non_tool_roles() {
        let m = ChatMessage::new(Role::Assistant, r#"{"citations":[{"content":"x","id":"1"}]}"#);
        assert!(parse_citations(&m).is_empty());
    }
}
