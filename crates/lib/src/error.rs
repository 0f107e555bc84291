//! Error taxonomy for the chat client.
//!
//! Every failure maps onto one of five kinds (see [`ErrorKind`]). The conversation
//! controller uses the kind to tell a stopped turn, which changes nothing, from a failed
//! one, which becomes a transcript `error` message.

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure or a non-success HTTP status from the backend.
    Transport,
    /// Malformed, empty, or server-reported failure inside the response stream.
    Protocol,
    /// The history service rejected a transcript update.
    Persistence,
    /// Identity probe failed; callers fall back to a guest identity.
    Auth,
    /// The user aborted the request. Never shown as an error.
    UserCancellation,
}

/// Failures detected while decoding a generate stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// First message of a fragment (or the whole turn) carried no content. The backend
    /// could not complete persistence for this turn.
    #[error("No content in messages object.")]
    NoContent,
    /// Fragment carried an explicit `error` field.
    #[error("{0}")]
    Server(String),
    /// Accumulated text can never become valid JSON.
    #[error("malformed stream fragment: {0}")]
    Malformed(String),
    /// A new conversation finished without the backend reporting its id.
    #[error("response did not include history metadata")]
    MissingMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Transport(String),
    /// Backend answered with a non-success status; `message` is the body's `error` field
    /// when present.
    #[error("history api error: {status} {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("could not save conversation: {0}")]
    Persistence(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Request(_) | ChatError::Transport(_) | ChatError::Api { .. } => {
                ErrorKind::Transport
            }
            ChatError::Protocol(_) => ErrorKind::Protocol,
            ChatError::Persistence(_) => ErrorKind::Persistence,
            ChatError::Auth(_) => ErrorKind::Auth,
            ChatError::Cancelled => ErrorKind::UserCancellation,
        }
    }

    pub fn is_no_content(&self) -> bool {
        matches!(self, ChatError::Protocol(ProtocolError::NoContent))
    }
}

pub const NO_CONTENT_ERROR: &str = "No content in messages object.";

const RETRY_HINT: &str =
    "Please try again. If the problem persists, please contact the site administrator.";

/// Text of the transcript `error` message that replaces a failed turn's answer.
pub fn turn_error_text(err: &ChatError) -> String {
    match err {
        ChatError::Protocol(ProtocolError::NoContent) => format!(
            "An error occurred. {} Chat history can't be saved at this time.",
            NO_CONTENT_ERROR
        ),
        ChatError::Protocol(ProtocolError::Server(message)) => parse_error_message(message),
        ChatError::Api { message, .. } => {
            let detail = if message.trim().is_empty() {
                RETRY_HINT.to_string()
            } else {
                parse_error_message(message)
            };
            format!(
                "There was an error generating a response. Chat history can't be saved at this time. {}",
                detail
            )
        }
        _ => format!("An error occurred. {}", RETRY_HINT),
    }
}

/// Notice shown (not persisted) when the transcript update is rejected.
pub const PERSISTENCE_ERROR_TEXT: &str =
    "An error occurred. Answers can't be saved at this time. If the problem persists, please contact the site administrator.";

const INNER_ERROR_CUE: &str = r"{\'error\': {\'message\': ";

/// Make a backend error string readable: unwrap an escaped inner `{'error': {'message': ...}}`
/// payload and explain content-filter rejections.
pub fn parse_error_message(error_message: &str) -> String {
    let mut message = error_message.to_string();
    let code_prefix = match message.find('-') {
        Some(i) => message[..=i].to_string(),
        None => String::new(),
    };
    if let Some(start) = message.find(INNER_ERROR_CUE) {
        let mut inner = &message[start..];
        if let Some(stripped) = inner.strip_suffix("'}}") {
            inner = stripped;
        }
        let inner = inner.replace(r"\'", "'");
        message = format!("{} {}", code_prefix, inner);
    }
    content_filter_explanation(&message).unwrap_or(message)
}

fn content_filter_explanation(message: &str) -> Option<String> {
    const MARKER: &str = "'innererror': ";
    let rest = &message[message.find(MARKER)? + MARKER.len()..];
    if !rest.starts_with('{') {
        return None;
    }
    // Inner object runs up to the last `}` that is followed by `}}`.
    let end = rest.rfind("}}}")?;
    let fixed = rest[..=end]
        .replace('\'', "\"")
        .replace("True", "true")
        .replace("False", "false");
    let inner: serde_json::Value = match serde_json::from_str(&fixed) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to parse inner error payload: {}", e);
            return None;
        }
    };
    let jailbreak = inner
        .pointer("/content_filter_result/jailbreak/filtered")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !jailbreak {
        return None;
    }
    Some(format!(
        "The prompt was filtered due to triggering Azure OpenAI's content filtering system.\n\
         Reason: This prompt contains content flagged as {}\n\n\
         Please modify your prompt and retry. Learn more: https://go.microsoft.com/fwlink/?linkid=2198766",
        "Jailbreak"
    ))
}
