//! Pipeline orchestrator, turn/barge-in coordinator, and call lifecycle
//! (C6 + C7 + C8).

pub mod messages;
pub mod orchestrator;
pub mod turn;

pub use messages::{AudioChunk, PlaybackChunk, SpeechSegment};
pub use orchestrator::{CallControl, Orchestrator};
pub use turn::TurnCoordinator;
