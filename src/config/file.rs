//! TOML configuration file loading
//!
//! Supports `~/.config/cadence/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CadenceConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    #[serde(default)]
    pub session: SessionFileConfig,

    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,
}

/// Voice pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Silence after the last chunk that ends an utterance
    pub silence_ms: Option<u64>,

    /// Byte cap on one utterance
    pub max_utterance_bytes: Option<usize>,

    /// "pcm16" or "encoded"
    pub audio_format: Option<String>,

    /// Sample rate of PCM input
    pub sample_rate: Option<u32>,

    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// "openai" or "elevenlabs"
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    pub max_tokens: Option<u32>,

    pub system_prompt: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Session registry configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub idle_timeout_secs: Option<u64>,
    pub max_sessions: Option<usize>,
}

/// Talk client configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    pub server_url: Option<String>,
    pub vad_aggressiveness: Option<u8>,
    pub vad_min_speech_ms: Option<u64>,
    pub vad_hangover_ms: Option<u64>,
    pub auto_listen: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CadenceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CadenceConfigFile {
    config_file_path().map_or_else(CadenceConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path with the same fallbacks
pub fn load_from(path: &Path) -> CadenceConfigFile {
    if !path.exists() {
        return CadenceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CadenceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CadenceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/cadence/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("cadence").join("config.toml"))
}
