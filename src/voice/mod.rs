//! Voice processing module
//!
//! HTTP-backed transcription, generation and synthesis for the server, plus
//! microphone capture, voice activity detection and playback for the talk
//! client.

mod capture;
pub mod llm;
pub mod mp3;
pub mod pcm;
mod playback;
mod resample;
pub mod stt;
pub mod tts;
pub mod vad;

use std::sync::Arc;

pub use capture::AudioCapture;
pub use llm::ChatCompletions;
pub use mp3::{Decoded, Mp3Stream, decode_mp3};
pub use pcm::{SAMPLE_RATE, level_dbfs, pcm16_to_wav, samples_to_pcm16};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, PlaybackQueue};
pub use stt::SpeechToText;
pub use tts::TextToSpeech;
pub use vad::{SpeechClassifier, VadConfig, VadEvent, VoiceActivityDetector, WebRtcClassifier};

use crate::config::{Config, SttProvider, TtsProvider};
use crate::gateway::Gateways;
use crate::{Error, Result};

fn require_key(key: Option<&String>, name: &str) -> Result<String> {
    key.cloned()
        .ok_or_else(|| Error::Config(format!("{name} API key is not configured")))
}

/// Build the HTTP collaborators described by `config`
///
/// # Errors
///
/// Returns error if a selected provider has no API key
pub fn gateways_from_config(config: &Config) -> Result<Gateways> {
    let voice = &config.voice;
    let keys = &config.api_keys;

    let stt = match voice.stt_provider {
        SttProvider::Whisper => SpeechToText::new_whisper(
            require_key(keys.openai.as_ref(), "OpenAI")?,
            voice.stt_model.clone(),
        )?,
        SttProvider::Deepgram => SpeechToText::new_deepgram(
            require_key(keys.deepgram.as_ref(), "Deepgram")?,
            voice.stt_model.clone(),
        )?,
    }
    .with_format(voice.audio_format, voice.sample_rate);

    let tts = match voice.tts_provider {
        TtsProvider::OpenAi => TextToSpeech::new_openai(
            require_key(keys.openai.as_ref(), "OpenAI")?,
            voice.tts_voice.clone(),
            voice.tts_speed,
            voice.tts_model.clone(),
        )?,
        TtsProvider::ElevenLabs => TextToSpeech::new_elevenlabs(
            require_key(keys.elevenlabs.as_ref(), "ElevenLabs")?,
            voice.tts_voice.clone(),
            voice.tts_model.clone(),
        )?,
    };

    let llm = ChatCompletions::new(
        config.llm.base_url.clone(),
        require_key(keys.openai.as_ref(), "OpenAI")?,
        config.llm.model.clone(),
        config.llm.max_tokens,
    )?;

    tracing::info!(
        stt = ?voice.stt_provider,
        tts = ?voice.tts_provider,
        model = %config.llm.model,
        "voice collaborators configured"
    );

    Ok(Gateways {
        transcriber: Arc::new(stt),
        generator: Arc::new(llm),
        synthesizer: Arc::new(tts),
    })
}
