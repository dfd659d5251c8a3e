//! Text-to-speech (TTS) processing
//!
//! Both providers return MP3. Responses are streamed and forwarded chunk by
//! chunk so playback can start before the whole fragment is synthesized.

use async_trait::async_trait;
use futures::StreamExt;

use crate::config::TtsProvider;
use crate::gateway::{ChunkSink, Synthesizer};
use crate::{Error, Result};

const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const ELEVENLABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(api_key: String, voice: String, speed: f32, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            provider: TtsProvider::OpenAi,
        })
    }

    /// Create a new TTS instance using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: String, voice_id: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0, // ElevenLabs doesn't use speed in the same way
            model,
            provider: TtsProvider::ElevenLabs,
        })
    }

    /// Synthesize a whole fragment into one MP3 buffer
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize_all(&self, text: &str) -> Result<Vec<u8>> {
        let response = self.request(text).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn request(&self, text: &str) -> Result<reqwest::Response> {
        let response = match self.provider {
            TtsProvider::OpenAi => self.request_openai(text).await?,
            TtsProvider::ElevenLabs => self.request_elevenlabs(text).await?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS API error");
            return Err(Error::Tts(format!("TTS API error {status}: {body}")));
        }

        Ok(response)
    }

    async fn request_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        Ok(self
            .client
            .post(OPENAI_SPEECH_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?)
    }

    async fn request_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{ELEVENLABS_URL}/{}/stream", self.voice);
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        Ok(self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?)
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, sink: &ChunkSink) -> Result<()> {
        if sink.is_stopped() {
            return Ok(());
        }
        tracing::debug!(chars = text.chars().count(), "starting synthesis");

        let response = tokio::select! {
            biased;
            () = sink.stopped() => return Ok(()),
            response = self.request(text) => response?,
        };

        let mut body = response.bytes_stream();
        let mut total = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                () = sink.stopped() => {
                    tracing::debug!(bytes = total, "synthesis stopped");
                    return Ok(());
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(chunk)) if !chunk.is_empty() => {
                    total += chunk.len();
                    if !sink.send(chunk.to_vec()).await {
                        tracing::debug!(bytes = total, "synthesis stopped");
                        return Ok(());
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::Tts(format!("audio stream failed: {e}"))),
                None => break,
            }
        }

        tracing::debug!(bytes = total, "synthesis complete");
        Ok(())
    }
}
