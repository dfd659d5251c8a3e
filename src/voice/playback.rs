//! Audio playback to speakers
//!
//! Decoded audio goes into a [`PlaybackQueue`] that the output stream drains
//! in order. Stopping clears the queue, so nothing queued before the stop is
//! heard after it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};

use super::mp3::{Decoded, decode_mp3};
use super::resample::Resampler;
use crate::{Error, Result};

/// Output rate (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Ordered, stoppable sample queue shared with the audio thread
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    samples: Arc<Mutex<VecDeque<f32>>>,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples behind everything already queued
    pub fn enqueue(&self, samples: &[f32]) {
        if let Ok(mut queue) = self.samples.lock() {
            queue.extend(samples.iter().copied());
        }
    }

    /// Drop everything not yet played
    pub fn stop(&self) -> usize {
        self.samples
            .lock()
            .map(|mut queue| {
                let dropped = queue.len();
                queue.clear();
                dropped
            })
            .unwrap_or_default()
    }

    /// Fill `out` from the front of the queue, padding with silence
    ///
    /// Returns the number of queued samples consumed.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        let Ok(mut queue) = self.samples.lock() else {
            out.fill(0.0);
            return 0;
        };

        let mut consumed = 0;
        for slot in out.iter_mut() {
            match queue.pop_front() {
                Some(sample) => {
                    *slot = sample;
                    consumed += 1;
                }
                None => *slot = 0.0,
            }
        }
        consumed
    }

    /// Samples still waiting to be played
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().map(|q| q.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plays queued audio on the default output device
///
/// Holds a running `cpal` stream, which is not `Send`.
pub struct AudioPlayback {
    queue: PlaybackQueue,
    resampler: Resampler,
    _stream: Stream,
}

impl AudioPlayback {
    /// Open the default output device and start draining `queue`
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(queue: PlaybackQueue) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();
        let channels = usize::from(config.channels);

        let source = queue.clone();
        let mut mono = Vec::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);
                    source.fill(&mut mono);
                    for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels,
            "audio playback initialized"
        );

        Ok(Self {
            queue,
            resampler: Resampler::new(config.sample_rate.0),
            _stream: stream,
        })
    }

    /// Queue decoded audio, resampling to the output rate
    ///
    /// Up to one resampler chunk may be held back until more audio or
    /// [`AudioPlayback::flush`] arrives.
    pub fn enqueue(&mut self, decoded: &Decoded) {
        if decoded.samples.is_empty() {
            return;
        }
        match self.resampler.process(&decoded.samples, decoded.sample_rate) {
            Ok(samples) => self.queue.enqueue(&samples),
            Err(e) => tracing::warn!(error = %e, "dropping audio that could not be resampled"),
        }
    }

    /// Queue whatever the resampler is still holding
    pub fn flush(&mut self) {
        match self.resampler.flush() {
            Ok(samples) => self.queue.enqueue(&samples),
            Err(e) => tracing::warn!(error = %e, "dropping resampler tail"),
        }
    }

    /// Drop everything not yet played
    pub fn stop(&mut self) {
        self.resampler.reset();
        let dropped = self.queue.stop();
        tracing::debug!(dropped_samples = dropped, "playback stopped");
    }

    /// Whether everything queued has been played
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// Play a complete MP3 buffer and wait for it to finish
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails
    pub async fn play_mp3(&mut self, mp3_data: &[u8]) -> Result<()> {
        let decoded = decode_mp3(mp3_data)?;
        self.enqueue(&decoded);
        self.flush();
        while !self.is_drained() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // let the device flush its last buffer
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracing::debug!(samples = decoded.samples.len(), "playback complete");
        Ok(())
    }
}
