//! Decides when to start and stop recognition and when the avatar speaks.
//!
//! Pure state machine: every input is a [`SpeechEvent`], every decision a [`SpeechEffect`].
//! Performing the effects is the driver's job.

use crate::config::SpeechConfig;

/// Reconnections with a fresh token after a connection failure.
pub const MAX_TOKEN_RETRIES: u8 = 3;

/// Microphone state. A successful cycle is `Ready -> Awaiting -> Recording -> Ready`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MicState {
    #[default]
    Ready,
    Awaiting,
    Recording,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The recognizer could not connect; usually an expired token.
    ConnectionFailure,
    Other(String),
}

/// Callbacks of a recognition session, as discrete events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    SessionStarted,
    SessionStopped,
    /// Interim hypothesis.
    Recognizing(String),
    /// Final text of the utterance.
    Recognized(String),
    Canceled(CancelReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    /// User pressed the microphone.
    StartListening,
    StopListening,
    TokenReceived(String),
    TokenUnavailable(String),
    Recognizer(RecognizerEvent),
    /// A turn was committed; `reply` is the final assistant text.
    TurnCompleted { reply: String },
    AvatarSpeechEnded,
    /// User interrupted the avatar.
    StopSpeaking,
    /// User stopped answer generation.
    GenerationStopped,
    SetAvatarEnabled(bool),
    SetSpeechToSpeech(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEffect {
    FetchToken,
    Connect(String),
    CloseRecognizer,
    /// Show interim text in the input box.
    SetDraft(String),
    SubmitQuestion(String),
    Speak(String),
    StopAvatar,
    MicChanged(MicState),
}

#[derive(Debug, Clone, Default)]
pub struct SpeechCoordinator {
    mic: MicState,
    token: Option<String>,
    retries: u8,
    avatar_enabled: bool,
    speech_to_speech: bool,
    avatar_speaking: bool,
}

impl SpeechCoordinator {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            avatar_enabled: config.avatar_enabled,
            speech_to_speech: config.speech_to_speech,
            ..Self::default()
        }
    }

    pub fn mic(&self) -> MicState {
        self.mic
    }

    pub fn avatar_speaking(&self) -> bool {
        self.avatar_speaking
    }

    pub fn avatar_enabled(&self) -> bool {
        self.avatar_enabled
    }

    pub fn speech_to_speech(&self) -> bool {
        self.speech_to_speech
    }

    /// Tokens used so far for reconnecting after connection failures.
    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn handle(&mut self, event: SpeechEvent) -> Vec<SpeechEffect> {
        match event {
            SpeechEvent::StartListening => self.start_listening(),
            SpeechEvent::StopListening => vec![SpeechEffect::CloseRecognizer],
            SpeechEvent::TokenReceived(token) => {
                self.token = Some(token.clone());
                if self.mic == MicState::Awaiting {
                    vec![SpeechEffect::Connect(token)]
                } else {
                    Vec::new()
                }
            }
            SpeechEvent::TokenUnavailable(reason) => {
                log::warn!("speech token unavailable: {}", reason);
                self.set_mic(MicState::Ready)
            }
            SpeechEvent::Recognizer(event) => self.on_recognizer(event),
            SpeechEvent::TurnCompleted { reply } => {
                if self.avatar_enabled && !reply.trim().is_empty() {
                    self.avatar_speaking = true;
                    vec![SpeechEffect::Speak(reply)]
                } else if self.speech_to_speech {
                    self.start_listening()
                } else {
                    Vec::new()
                }
            }
            SpeechEvent::AvatarSpeechEnded => {
                self.avatar_speaking = false;
                if self.speech_to_speech {
                    self.start_listening()
                } else {
                    Vec::new()
                }
            }
            SpeechEvent::StopSpeaking => {
                if !self.avatar_speaking {
                    return Vec::new();
                }
                self.avatar_speaking = false;
                vec![SpeechEffect::StopAvatar]
            }
            SpeechEvent::GenerationStopped => {
                if self.speech_to_speech {
                    vec![SpeechEffect::CloseRecognizer]
                } else {
                    Vec::new()
                }
            }
            SpeechEvent::SetAvatarEnabled(enabled) => {
                self.avatar_enabled = enabled;
                if !enabled && self.avatar_speaking {
                    self.avatar_speaking = false;
                    vec![SpeechEffect::StopAvatar]
                } else {
                    Vec::new()
                }
            }
            SpeechEvent::SetSpeechToSpeech(enabled) => {
                self.speech_to_speech = enabled;
                Vec::new()
            }
        }
    }

    fn set_mic(&mut self, mic: MicState) -> Vec<SpeechEffect> {
        if self.mic == mic {
            return Vec::new();
        }
        log::debug!("microphone {:?} -> {:?}", self.mic, mic);
        self.mic = mic;
        vec![SpeechEffect::MicChanged(mic)]
    }

    fn start_listening(&mut self) -> Vec<SpeechEffect> {
        // The microphone is disabled while busy or while the avatar talks.
        if self.mic != MicState::Ready || self.avatar_speaking {
            return Vec::new();
        }
        self.retries = 0;
        let mut effects = self.set_mic(MicState::Awaiting);
        effects.push(match &self.token {
            Some(token) => SpeechEffect::Connect(token.clone()),
            None => SpeechEffect::FetchToken,
        });
        effects
    }

    fn on_recognizer(&mut self, event: RecognizerEvent) -> Vec<SpeechEffect> {
        match event {
            RecognizerEvent::SessionStarted => {
                if self.mic == MicState::Awaiting {
                    self.set_mic(MicState::Recording)
                } else {
                    Vec::new()
                }
            }
            RecognizerEvent::SessionStopped => {
                self.retries = 0;
                self.set_mic(MicState::Ready)
            }
            RecognizerEvent::Recognizing(text) => vec![SpeechEffect::SetDraft(text)],
            RecognizerEvent::Recognized(text) => {
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![SpeechEffect::SubmitQuestion(text)]
                }
            }
            RecognizerEvent::Canceled(CancelReason::ConnectionFailure) => {
                self.token = None;
                if self.retries < MAX_TOKEN_RETRIES {
                    self.retries += 1;
                    log::debug!(
                        "speech connection failed, refreshing token ({}/{})",
                        self.retries,
                        MAX_TOKEN_RETRIES
                    );
                    let mut effects = self.set_mic(MicState::Awaiting);
                    effects.push(SpeechEffect::FetchToken);
                    effects
                } else {
                    log::warn!(
                        "speech connection failed after {} token refreshes, giving up",
                        MAX_TOKEN_RETRIES
                    );
                    self.set_mic(MicState::Ready)
                }
            }
            RecognizerEvent::Canceled(CancelReason::Other(reason)) => {
                log::warn!("speech recognition canceled: {}", reason);
                self.set_mic(MicState::Ready)
            }
        }
    }
}
