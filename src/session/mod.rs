//! Server-side voice sessions
//!
//! A session turns a stream of audio fragments into utterances, runs one
//! turn per utterance and keeps the conversation history. Everything for a
//! connection is owned by its [`SessionCoordinator`].

pub mod buffer;
pub mod coordinator;
pub mod flush;
pub mod history;
pub mod segmenter;
pub mod store;
pub mod turn;

pub use buffer::{AudioBuffer, BufferStatus};
pub use coordinator::{Inbound, SessionCoordinator, SessionIdentity, SessionSettings};
pub use flush::{FlushBuffer, should_flush};
pub use history::{Closed, ConversationHistory, INTERRUPTION_MARKER, Role, Turn};
pub use segmenter::{Boundary, DEFAULT_SILENCE, Utterance, UtteranceSegmenter};
pub use store::{SessionInfo, SessionStore};
pub use turn::{SessionPhase, TurnError, TurnEvent, TurnEventKind, TurnId, TurnTask};
