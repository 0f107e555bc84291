//! Lifecycle notifications published to the host while turns run.

/// Sent on the controller's event channel, in the order things happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A request was issued; loading is on.
    TurnStarted { turn_id: String },
    /// More assistant text arrived.
    AssistantDelta { turn_id: String, delta: String },
    /// Loading for this turn is over. Sent exactly once per turn.
    LoadingFinished { turn_id: String },
    /// The turn's messages were appended to the conversation.
    Committed { conversation_id: String },
    /// The history service accepted the full transcript.
    Saved { conversation_id: String },
    /// The history service rejected the transcript; a notice was shown.
    SaveFailed { conversation_id: String },
}
