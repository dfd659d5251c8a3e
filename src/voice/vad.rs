//! Voice activity detection
//!
//! Captured frames are regrouped into 30 ms windows, and each window is
//! classified by the WebRTC detector. Speech starts only after voiced audio
//! has lasted `min_speech`, and ends only after unvoiced audio has lasted
//! `hangover`, so clicks and short pauses between words do not flip the state.

use std::fmt;
use std::time::Duration;

use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::{Error, Result};

/// Classification window; the WebRTC detector accepts 10, 20 or 30 ms
const WINDOW_MS: u64 = 30;
const WINDOW: Duration = Duration::from_millis(WINDOW_MS);

/// Detector tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadConfig {
    /// WebRTC mode, 0 (permissive) to 3 (most aggressive)
    pub aggressiveness: u8,
    /// Voiced audio needed before speech starts
    pub min_speech: Duration,
    /// Unvoiced audio needed before speech ends
    pub hangover: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: 2,
            min_speech: Duration::from_millis(150),
            hangover: Duration::from_millis(300),
        }
    }
}

/// Edge reported by [`VoiceActivityDetector::process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Decides whether one window of 16-bit samples is speech
pub trait SpeechClassifier {
    fn is_speech(&mut self, window: &[i16]) -> bool;
}

impl<F> SpeechClassifier for F
where
    F: FnMut(&[i16]) -> bool,
{
    fn is_speech(&mut self, window: &[i16]) -> bool {
        self(window)
    }
}

/// The WebRTC GMM detector
///
/// Not `Send`; it lives on the talk runtime's task next to the capture stream.
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    /// # Errors
    ///
    /// Returns error for a rate other than 8, 16, 32 or 48 kHz, or an
    /// aggressiveness above 3
    pub fn new(aggressiveness: u8, sample_rate: u32) -> Result<Self> {
        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(Error::Config(format!(
                    "VAD aggressiveness must be 0-3, got {other}"
                )));
            }
        };
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(Error::Config(format!(
                    "VAD supports 8000, 16000, 32000 or 48000 Hz, got {other}"
                )));
            }
        };

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);
        tracing::debug!(aggressiveness, sample_rate, "voice activity detector ready");
        Ok(Self { vad })
    }
}

impl fmt::Debug for WebRtcClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcClassifier").finish_non_exhaustive()
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn is_speech(&mut self, window: &[i16]) -> bool {
        self.vad.is_voice_segment(window).unwrap_or_else(|()| {
            tracing::trace!(samples = window.len(), "window rejected by detector");
            false
        })
    }
}

/// Tracks speech/silence over a stream of frames of any length
#[derive(Debug)]
pub struct VoiceActivityDetector<C = WebRtcClassifier> {
    config: VadConfig,
    classifier: C,
    window: usize,
    pending: Vec<i16>,
    speaking: bool,
    voiced: Duration,
    unvoiced: Duration,
}

impl VoiceActivityDetector {
    /// Detector backed by the WebRTC classifier
    ///
    /// # Errors
    ///
    /// Returns error if the rate or aggressiveness is unsupported
    pub fn new(config: VadConfig, sample_rate: u32) -> Result<Self> {
        let classifier = WebRtcClassifier::new(config.aggressiveness, sample_rate)?;
        Ok(Self::with_classifier(config, sample_rate, classifier))
    }
}

impl<C: SpeechClassifier> VoiceActivityDetector<C> {
    #[must_use]
    pub fn with_classifier(config: VadConfig, sample_rate: u32, classifier: C) -> Self {
        let per_window = u64::from(sample_rate) * WINDOW_MS / 1000;
        Self {
            config,
            classifier,
            window: usize::try_from(per_window).unwrap_or(usize::MAX).max(1),
            pending: Vec::new(),
            speaking: false,
            voiced: Duration::ZERO,
            unvoiced: Duration::ZERO,
        }
    }

    /// Feed one captured frame; returns every edge crossed, in order
    ///
    /// Samples that do not fill a whole window wait for the next frame.
    pub fn process(&mut self, frame: &[f32]) -> Vec<VadEvent> {
        self.pending.extend(frame.iter().map(|&s| to_i16(s)));

        let mut edges = Vec::new();
        let mut start = 0;
        while self.pending.len() - start >= self.window {
            let voiced = self
                .classifier
                .is_speech(&self.pending[start..start + self.window]);
            start += self.window;
            edges.extend(self.advance(voiced));
        }
        self.pending.drain(..start);
        edges
    }

    /// Whether speech is currently in progress
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    fn advance(&mut self, voiced: bool) -> Option<VadEvent> {
        if voiced {
            self.voiced += WINDOW;
            self.unvoiced = Duration::ZERO;
        } else {
            self.unvoiced += WINDOW;
            if !self.speaking {
                self.voiced = Duration::ZERO;
            }
        }

        if !self.speaking && self.voiced >= self.config.min_speech {
            self.speaking = true;
            self.unvoiced = Duration::ZERO;
            tracing::trace!("speech started");
            return Some(VadEvent::SpeechStart);
        }

        if self.speaking && self.unvoiced >= self.config.hangover {
            self.speaking = false;
            self.voiced = Duration::ZERO;
            tracing::trace!("speech ended");
            return Some(VadEvent::SpeechEnd);
        }

        None
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
