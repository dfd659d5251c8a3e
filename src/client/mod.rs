//! Voice client
//!
//! The state machine is independent of audio hardware and the network so it
//! can be driven directly in tests; [`talk`] connects it to both.

pub mod machine;
pub mod talk;

pub use machine::{ClientAction, ClientEvent, PREROLL_FRAMES, VoiceClient, VoiceMode};
pub use talk::TalkOptions;
