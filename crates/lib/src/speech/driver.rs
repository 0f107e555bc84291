//! Async driver: performs a coordinator's effects against the recognizer, the avatar and
//! the token endpoint, and feeds their results back in as events.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use super::coordinator::{
    CancelReason, MicState, RecognizerEvent, SpeechCoordinator, SpeechEffect, SpeechEvent,
};
use super::{Avatar, Recognizer, TokenSource};
use crate::config::SpeechConfig;

/// Runs a [`SpeechCoordinator`] against real collaborators.
pub struct SpeechDriver<R, A, T> {
    coordinator: SpeechCoordinator,
    recognizer: R,
    avatar: A,
    tokens: T,
}

impl<R, A, T> SpeechDriver<R, A, T>
where
    R: Recognizer,
    A: Avatar,
    T: TokenSource,
{
    pub fn new(config: &SpeechConfig, recognizer: R, avatar: A, tokens: T) -> Self {
        Self {
            coordinator: SpeechCoordinator::new(config),
            recognizer,
            avatar,
            tokens,
        }
    }

    pub fn coordinator(&self) -> &SpeechCoordinator {
        &self.coordinator
    }

    pub fn mic(&self) -> MicState {
        self.coordinator.mic()
    }

    /// Feed `event` and perform every effect it leads to. Effects meant for the host
    /// (mic changes, drafts, recognized questions) are returned in order.
    pub async fn dispatch(&mut self, event: SpeechEvent) -> Vec<SpeechEffect> {
        let mut queue = VecDeque::from([event]);
        let mut host = Vec::new();
        while let Some(event) = queue.pop_front() {
            for effect in self.coordinator.handle(event) {
                match effect {
                    SpeechEffect::FetchToken => match self.tokens.fetch_token().await {
                        Ok(token) => queue.push_back(SpeechEvent::TokenReceived(token)),
                        Err(e) => queue.push_back(SpeechEvent::TokenUnavailable(e.to_string())),
                    },
                    SpeechEffect::Connect(token) => {
                        if let Err(e) = self.recognizer.connect(&token).await {
                            log::warn!("speech recognizer failed to connect: {}", e);
                            queue.push_back(SpeechEvent::Recognizer(RecognizerEvent::Canceled(
                                CancelReason::ConnectionFailure,
                            )));
                        }
                    }
                    SpeechEffect::CloseRecognizer => self.recognizer.close().await,
                    SpeechEffect::Speak(text) => {
                        if let Err(e) = self.avatar.speak(&text).await {
                            log::warn!("avatar could not speak: {}", e);
                        }
                        queue.push_back(SpeechEvent::AvatarSpeechEnded);
                    }
                    SpeechEffect::StopAvatar => self.avatar.stop().await,
                    other => host.push(other),
                }
            }
        }
        host
    }

    /// Capture one utterance: arm the microphone if needed, then pump recognizer events
    /// until the microphone is back to ready.
    pub async fn listen(&mut self) -> Vec<SpeechEffect> {
        let mut host = Vec::new();
        if self.coordinator.mic() == MicState::Ready {
            host.extend(self.dispatch(SpeechEvent::StartListening).await);
        }
        while self.coordinator.mic() != MicState::Ready {
            let event = match self.recognizer.next_event().await {
                Some(event) => event,
                None => RecognizerEvent::SessionStopped,
            };
            host.extend(self.dispatch(SpeechEvent::Recognizer(event)).await);
        }
        host
    }

    /// Serve events from the chat flow (see `ChatController::with_speech`) until every
    /// sender is gone. While the microphone is armed, recognizer callbacks are pumped as
    /// well. Effects meant for the host are forwarded to `host`.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SpeechEvent>,
        host: mpsc::UnboundedSender<SpeechEffect>,
    ) {
        loop {
            let event = if self.coordinator.mic() == MicState::Ready {
                match events.recv().await {
                    Some(event) => event,
                    None => break,
                }
            } else {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    event = self.recognizer.next_event() => SpeechEvent::Recognizer(
                        event.unwrap_or(RecognizerEvent::SessionStopped),
                    ),
                }
            };
            for effect in self.dispatch(event).await {
                let _ = host.send(effect);
            }
        }
        if self.coordinator.mic() != MicState::Ready {
            self.recognizer.close().await;
        }
        log::debug!("speech driver stopped");
    }
}

/// The question a [`SpeechDriver::listen`] call recognized, if any.
pub fn recognized_question(effects: &[SpeechEffect]) -> Option<&str> {
    effects.iter().find_map(|e| match e {
        SpeechEffect::SubmitQuestion(q) => Some(q.as_str()),
        _ => None,
    })
}
