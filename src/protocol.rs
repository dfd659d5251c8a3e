//! Voice wire protocol
//!
//! JSON text frames, one message per frame, tagged by `type`. The client and
//! server message sets are disjoint. There is no sequencing, acknowledgement
//! or replay: ordering comes from each side having exactly one sender.
//!
//! Binary payloads (`audio_input`, `audio_chunk`) travel as standard base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reasons an inbound frame could not be turned into a message
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame has no string `type` field
    #[error("message has no type")]
    MissingType,

    /// Frame carries a tag this side does not understand
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Required payload field is absent
    #[error("message {kind} is missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    /// Audio payload is not valid base64
    #[error("audio payload could not be decoded: {0}")]
    AudioDecode(#[from] base64::DecodeError),

    /// Frame kind is not part of the protocol (e.g. binary frames)
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
}

impl ProtocolError {
    /// Whether this error only affects one audio chunk
    ///
    /// Such chunks are dropped and logged; the client is not told.
    #[must_use]
    pub const fn is_audio_decode(&self) -> bool {
        matches!(self, Self::AudioDecode(_))
    }
}

/// Message sent from the client to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A fragment of microphone audio
    AudioInput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The user finished speaking; skip the silence timer
    EndUtterance,
    /// Stop the in-flight reply
    Interrupt,
}

impl ClientMessage {
    /// Parse a client frame
    ///
    /// Dispatches on the tag before looking at the payload so an unknown tag
    /// and an undecodable audio chunk can be told apart.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing why the frame was rejected
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match tag {
            "audio_input" => {
                let data = value
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField {
                        kind: "audio_input",
                        field: "data",
                    })?;
                Ok(Self::AudioInput {
                    data: BASE64.decode(data)?,
                })
            }
            "end_utterance" => Ok(Self::EndUtterance),
            "interrupt" => Ok(Self::Interrupt),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Message sent from the server to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session identity, sent once after the upgrade
    SessionStarted { session_id: String },
    /// Transcript of the user's utterance
    SttResult { text: String },
    /// One generated token
    LlmToken { token: String },
    /// Encoded synthesized audio, in production order
    AudioChunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The assistant reply is finished
    ResponseComplete,
    /// User-visible failure
    Error { error: String },
}

impl ServerMessage {
    /// Parse a server frame
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the frame is not a known server message
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        if !matches!(
            tag,
            "session_started"
                | "stt_result"
                | "llm_token"
                | "audio_chunk"
                | "response_complete"
                | "error"
        ) {
            return Err(ProtocolError::UnknownType(tag.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Convenience constructor for error messages
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Short tag for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SttResult { .. } => "stt_result",
            Self::LlmToken { .. } => "llm_token",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::ResponseComplete => "response_complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Serde adapter for base64-encoded byte fields
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
