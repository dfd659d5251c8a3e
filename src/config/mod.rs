//! Configuration management for Cadence
//!
//! Values are layered: environment variables win over the TOML file, which
//! wins over built-in defaults.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use crate::session::SessionSettings;
use crate::voice::VadConfig;
use crate::{Error, Result};

use file::CadenceConfigFile;

const DEFAULT_PORT: u16 = 18790;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. \
Answer in short, natural spoken sentences without markdown or lists.";

/// Cadence configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub llm: LlmConfig,
    pub api_keys: ApiKeys,
    pub session: SessionConfig,
    pub client: ClientConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Encoding of inbound `audio_input` payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    /// Raw mono 16-bit little-endian PCM; wrapped as WAV before transcription
    #[default]
    Pcm16,
    /// Already containerized audio (e.g. webm/opus from a browser)
    Encoded,
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcm16" | "pcm" => Ok(Self::Pcm16),
            "encoded" | "webm" => Ok(Self::Encoded),
            other => Err(Error::Config(format!("unknown audio format: {other}"))),
        }
    }
}

/// Speech-to-text backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttProvider {
    #[default]
    Whisper,
    Deepgram,
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Text-to-speech backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    #[default]
    OpenAi,
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Voice pipeline configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Silence after the last chunk that ends an utterance
    pub silence_ms: u64,

    /// Byte cap on one utterance; reaching it finalizes early
    pub max_utterance_bytes: usize,

    pub audio_format: AudioFormat,

    /// Sample rate of PCM input
    pub sample_rate: u32,

    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1", "eleven_turbo_v2")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0, `OpenAI` only)
    pub tts_speed: f32,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// First turn of every conversation
    pub system_prompt: String,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS and chat completions)
    pub openai: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,
}

/// Session registry configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions without inbound traffic for this long are closed
    pub idle_timeout_secs: u64,
    /// Upgrades beyond this many live sessions are refused
    pub max_sessions: usize,
}

/// Talk client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the voice endpoint
    pub server_url: String,
    /// WebRTC detector mode, 0 (permissive) to 3 (most aggressive)
    pub vad_aggressiveness: u8,
    /// Speech must last this long before it counts
    pub vad_min_speech_ms: u64,
    /// Silence must last this long before speech ends
    pub vad_hangover_ms: u64,
    /// Return to listening after each reply
    pub auto_listen: bool,
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources(fc: CadenceConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.is_empty());

        let server = ServerConfig {
            port: parse_env(&env, "CADENCE_PORT")?
                .or(parse_env(&env, "PORT")?)
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
        };

        let audio_format = match var("CADENCE_AUDIO_FORMAT").or(fc.voice.audio_format) {
            Some(s) => s.parse()?,
            None => AudioFormat::default(),
        };
        let stt_provider = match var("CADENCE_STT_PROVIDER").or(fc.voice.stt_provider) {
            Some(s) => s.parse()?,
            None => SttProvider::default(),
        };
        let tts_provider = match var("CADENCE_TTS_PROVIDER").or(fc.voice.tts_provider) {
            Some(s) => s.parse()?,
            None => TtsProvider::default(),
        };

        let voice = VoiceConfig {
            silence_ms: parse_env(&env, "CADENCE_SILENCE_MS")?
                .or(fc.voice.silence_ms)
                .unwrap_or(500),
            max_utterance_bytes: parse_env(&env, "CADENCE_MAX_UTTERANCE_BYTES")?
                .or(fc.voice.max_utterance_bytes)
                .unwrap_or(1_920_000),
            audio_format,
            sample_rate: parse_env(&env, "CADENCE_SAMPLE_RATE")?
                .or(fc.voice.sample_rate)
                .unwrap_or(crate::voice::SAMPLE_RATE),
            stt_provider,
            stt_model: var("CADENCE_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| default_stt_model(stt_provider).to_string()),
            tts_provider,
            tts_model: var("CADENCE_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| default_tts_model(tts_provider).to_string()),
            tts_voice: var("CADENCE_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .unwrap_or_else(|| "alloy".to_string()),
            tts_speed: parse_env(&env, "CADENCE_TTS_SPEED")?
                .or(fc.voice.tts_speed)
                .unwrap_or(1.0),
        };

        let llm = LlmConfig {
            base_url: var("CADENCE_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: var("CADENCE_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_tokens: parse_env(&env, "CADENCE_LLM_MAX_TOKENS")?
                .or(fc.llm.max_tokens)
                .unwrap_or(512),
            system_prompt: var("CADENCE_SYSTEM_PROMPT")
                .or(fc.llm.system_prompt)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let api_keys = ApiKeys {
            openai: var("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: var("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: var("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };

        let session = SessionConfig {
            idle_timeout_secs: parse_env(&env, "CADENCE_IDLE_TIMEOUT_SECS")?
                .or(fc.session.idle_timeout_secs)
                .unwrap_or(600),
            max_sessions: parse_env(&env, "CADENCE_MAX_SESSIONS")?
                .or(fc.session.max_sessions)
                .unwrap_or(256),
        };

        let client = ClientConfig {
            server_url: var("CADENCE_SERVER_URL")
                .or(fc.client.server_url)
                .unwrap_or_else(|| format!("ws://127.0.0.1:{}/ws/voice", server.port)),
            vad_aggressiveness: parse_env(&env, "CADENCE_VAD_AGGRESSIVENESS")?
                .or(fc.client.vad_aggressiveness)
                .unwrap_or(2),
            vad_min_speech_ms: fc.client.vad_min_speech_ms.unwrap_or(150),
            vad_hangover_ms: fc.client.vad_hangover_ms.unwrap_or(300),
            auto_listen: env("CADENCE_AUTO_LISTEN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.client.auto_listen)
                .unwrap_or(true),
        };

        let config = Self {
            server,
            voice,
            llm,
            api_keys,
            session,
            client,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.voice.silence_ms == 0 {
            return Err(Error::Config("voice.silence_ms must be positive".to_string()));
        }
        if self.voice.max_utterance_bytes == 0 {
            return Err(Error::Config(
                "voice.max_utterance_bytes must be positive".to_string(),
            ));
        }
        if self.session.max_sessions == 0 {
            return Err(Error::Config("session.max_sessions must be positive".to_string()));
        }
        if !(0.25..=4.0).contains(&self.voice.tts_speed) {
            return Err(Error::Config(format!(
                "voice.tts_speed {} is outside 0.25..=4.0",
                self.voice.tts_speed
            )));
        }
        if self.client.vad_aggressiveness > 3 {
            return Err(Error::Config(format!(
                "client.vad_aggressiveness {} is outside 0..=3",
                self.client.vad_aggressiveness
            )));
        }
        Ok(())
    }

    /// Per-session tunables derived from this config
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            silence: Duration::from_millis(self.voice.silence_ms),
            max_utterance_bytes: self.voice.max_utterance_bytes,
            system_prompt: self.llm.system_prompt.clone(),
        }
    }

    /// Voice activity detector tuning for the talk client
    #[must_use]
    pub const fn vad_config(&self) -> VadConfig {
        VadConfig {
            aggressiveness: self.client.vad_aggressiveness,
            min_speech: Duration::from_millis(self.client.vad_min_speech_ms),
            hangover: Duration::from_millis(self.client.vad_hangover_ms),
        }
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }
}

const fn default_stt_model(provider: SttProvider) -> &'static str {
    match provider {
        SttProvider::Whisper => "whisper-1",
        SttProvider::Deepgram => "nova-2",
    }
}

const fn default_tts_model(provider: TtsProvider) -> &'static str {
    match provider {
        TtsProvider::OpenAi => "tts-1",
        TtsProvider::ElevenLabs => "eleven_turbo_v2",
    }
}

/// Read and parse one environment variable; empty counts as unset
fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match env(key).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}"))),
        None => Ok(None),
    }
}
