//! HTTP client for the history backend (`/history/*`, `/token`, `/.auth/me`).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::models::{ChatMessage, Conversation, HistoryHealth, HistoryStatus, UserInfo};
use super::{ByteStream, HistoryApi};
use crate::config::BackendConfig;
use crate::error::{ChatError, ProtocolError};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:50505";

/// Client for the history backend.
#[derive(Clone)]
pub struct HistoryClient {
    base_url: String,
    client: reqwest::Client,
}

/// Subset of `GET /frontend_settings` the client acts on.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrontendSettings {
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default)]
    pub feedback_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ConversationSummary {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default, rename = "createdAt")]
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

impl HistoryClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Client for the configured backend. Only connecting is bounded by a timeout: a
    /// generate body may legitimately stream for a long time.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Non-success statuses become [`ChatError::Api`], using the body's `error` field when present.
    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error").map(|e| match e.as_str() {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                })
            })
            .unwrap_or(body);
        Err(ChatError::Api { status, message })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ChatError> {
        let res = self.client.post(self.url(path)).json(&body).send().await?;
        Self::check(res).await
    }

    async fn delete_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ChatError> {
        let res = self.client.delete(self.url(path)).json(&body).send().await?;
        Self::check(res).await
    }

    /// GET /token: short-lived speech service token.
    pub async fn speech_token(&self) -> Result<String, ChatError> {
        let res = self.client.get(self.url("/token")).send().await?;
        let data: TokenResponse = Self::check(res).await?.json().await?;
        data.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChatError::Auth("token endpoint returned no token".to_string()))
    }

    /// GET /.auth/me: identity claim sets. Failures are reported as [`ChatError::Auth`].
    pub async fn user_info(&self) -> Result<Vec<UserInfo>, ChatError> {
        let res = self
            .client
            .get(self.url("/.auth/me"))
            .send()
            .await
            .map_err(|e| ChatError::Auth(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ChatError::Auth(format!(
                "authentication error, status {}",
                res.status()
            )));
        }
        res.json().await.map_err(|e| ChatError::Auth(e.to_string()))
    }

    /// GET /frontend_settings
    pub async fn frontend_settings(&self) -> Result<FrontendSettings, ChatError> {
        let res = self.client.get(self.url("/frontend_settings")).send().await?;
        Ok(Self::check(res).await?.json().await?)
    }
}

#[async_trait]
impl HistoryApi for HistoryClient {
    /// POST /history/generate: streamed NDJSON answer.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        conversation_id: Option<&str>,
    ) -> Result<ByteStream, ChatError> {
        let body = match conversation_id {
            Some(id) => json!({ "conversation_id": id, "messages": messages }),
            None => json!({ "messages": messages }),
        };
        log::debug!(
            "generate: {} messages, conversation {:?}",
            messages.len(),
            conversation_id
        );
        let res = self.post_json("/history/generate", body).await?;
        let stream = res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ChatError::from));
        Ok(stream.boxed())
    }

    /// POST /history/update: always the full transcript, never a delta.
    async fn update(
        &self,
        messages: &[ChatMessage],
        conversation_id: &str,
    ) -> Result<(), ChatError> {
        let body = json!({ "conversation_id": conversation_id, "messages": messages });
        match self.post_json("/history/update", body).await {
            Ok(_) => Ok(()),
            Err(e) => Err(ChatError::Persistence(e.to_string())),
        }
    }

    /// GET /history/ensure: never fails; transport problems are folded into the status.
    async fn ensure(&self) -> HistoryHealth {
        let res = match self.client.get(self.url("/history/ensure")).send().await {
            Ok(res) => res,
            Err(e) => {
                log::warn!("history ensure failed: {}", e);
                return HistoryHealth {
                    available: false,
                    status: HistoryStatus::Other(e.to_string()),
                };
            }
        };
        let status = res.status();
        let body: serde_json::Value = res.json().await.unwrap_or(serde_json::Value::Null);
        let reported = if body.get("message").map_or(false, |m| !m.is_null()) {
            HistoryStatus::Working
        } else {
            match status.as_u16() {
                500 => HistoryStatus::NotWorking,
                401 => HistoryStatus::InvalidCredentials,
                422 => HistoryStatus::Other(
                    body.get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("history is misconfigured")
                        .to_string(),
                ),
                _ => HistoryStatus::NotConfigured,
            }
        };
        HistoryHealth {
            available: status.is_success(),
            status: reported,
        }
    }

    /// GET /history/list?offset=: conversations with their messages loaded. A conversation
    /// whose messages cannot be read is returned empty rather than failing the list.
    async fn list(&self, offset: usize) -> Result<Vec<Conversation>, ChatError> {
        let url = format!("{}?offset={}", self.url("/history/list"), offset);
        let res = Self::check(self.client.get(&url).send().await?).await?;
        let payload: serde_json::Value = res.json().await?;
        if !payload.is_array() {
            return Err(ProtocolError::Malformed("history list is not an array".to_string()).into());
        }
        let summaries: Vec<ConversationSummary> = serde_json::from_value(payload)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let conversations = future::join_all(summaries.into_iter().map(|summary| async move {
            let messages = match self.read(&summary.id).await {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("error fetching messages for {}: {}", summary.id, e);
                    Vec::new()
                }
            };
            Conversation {
                id: summary.id,
                title: summary.title,
                date: summary.created_at,
                messages,
            }
        }))
        .await;
        Ok(conversations)
    }

    /// POST /history/read
    async fn read(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let res = self
            .post_json("/history/read", json!({ "conversation_id": conversation_id }))
            .await?;
        let data: ReadResponse = res.json().await?;
        Ok(data.messages)
    }

    /// POST /history/clear: drop the messages but keep the conversation.
    async fn clear(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.post_json("/history/clear", json!({ "conversation_id": conversation_id }))
            .await
            .map(|_| ())
    }

    /// DELETE /history/delete
    async fn delete(&self, conversation_id: &str) -> Result<(), ChatError> {
        self.delete_json("/history/delete", json!({ "conversation_id": conversation_id }))
            .await
            .map(|_| ())
    }

    /// DELETE /history/delete_all
    async fn delete_all(&self) -> Result<(), ChatError> {
        self.delete_json("/history/delete_all", json!({}))
            .await
            .map(|_| ())
    }

    /// POST /history/rename
    async fn rename(&self, conversation_id: &str, title: &str) -> Result<(), ChatError> {
        self.post_json(
            "/history/rename",
            json!({ "conversation_id": conversation_id, "title": title }),
        )
        .await
        .map(|_| ())
    }

    /// POST /history/message_feedback
    async fn message_feedback(&self, message_id: &str, feedback: &str) -> Result<(), ChatError> {
        self.post_json(
            "/history/message_feedback",
            json!({ "message_id": message_id, "message_feedback": feedback }),
        )
        .await
        .map(|_| ())
    }
}
