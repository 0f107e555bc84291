//! Conversation core: per-turn reduction, request lifecycle, and the transcript owner.

mod controller;
mod events;
mod handle;
mod reducer;

pub use controller::{ChatController, SaveStatus, Turn, TurnOutcome, TurnResult};
pub use events::ChatEvent;
pub use handle::{Canceller, RequestHandle};
pub use reducer::{apply_response, complete, fail, reduce, StreamFragment, TurnPhase, TurnState};
