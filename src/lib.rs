//! Cadence - Real-time voice conversation pipeline
//!
//! This library provides the pieces of a spoken assistant conversation:
//! - A WebSocket server that turns streamed microphone audio into a spoken reply
//! - Per-session orchestration of transcription, generation and synthesis
//! - Interruption (barge-in) with cooperative cancellation
//! - A voice client state machine and terminal runtime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Client (cadence talk)                │
//! │   Mic  │  VAD  │  State Machine  │  Playback         │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket (JSON messages)
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Session Coordinator                  │
//! │   Segmenter  │  History  │  Interrupts  │  Turn      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Collaborators                      │
//! │   STT  │  LLM (streaming)  │  TTS (streaming)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod session;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use gateway::{GenerationError, Gateways, Generator, Synthesizer, TokenStream, Transcriber};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use session::{SessionCoordinator, SessionStore};
