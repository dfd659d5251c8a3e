//! Streaming sample-rate conversion for playback
//!
//! Decoded MP3 arrives a few frames at a time. The FFT resampler only takes
//! whole input chunks, so the tail of each batch waits for the next one and
//! [`Resampler::flush`] pads out whatever is left when a reply ends.

use rubato::{FftFixedIn, Resampler as _};

use crate::{Error, Result};

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Mono resampler that keeps state across batches of one stream
pub struct Resampler {
    output_rate: u32,
    input_rate: u32,
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("output_rate", &self.output_rate)
            .field("input_rate", &self.input_rate)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Resampler {
    #[must_use]
    pub const fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            input_rate: output_rate,
            inner: None,
            pending: Vec::new(),
        }
    }

    /// Convert the next batch of a stream at `input_rate`
    ///
    /// A change of input rate flushes the old stream first.
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built for these rates
    pub fn process(&mut self, samples: &[f32], input_rate: u32) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if input_rate != self.input_rate {
            out = self.flush()?;
            self.reconfigure(input_rate)?;
        }

        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(samples);
            return Ok(out);
        };

        self.pending.extend_from_slice(samples);
        let mut consumed = 0;
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }
            let chunk = &self.pending[consumed..consumed + needed];
            let resampled = inner
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            out.extend_from_slice(&resampled[0]);
            consumed += needed;
        }
        self.pending.drain(..consumed);
        Ok(out)
    }

    /// Resample the buffered tail, padded with silence, and start over
    ///
    /// # Errors
    ///
    /// Returns error if the final chunk cannot be processed
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let tail: &[&[f32]] = &[self.pending.as_slice()];
        let resampled = inner
            .process_partial(Some(tail), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        self.pending.clear();
        inner.reset();
        Ok(resampled.into_iter().next().unwrap_or_default())
    }

    /// Drop buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn reconfigure(&mut self, input_rate: u32) -> Result<()> {
        self.input_rate = input_rate;
        self.pending.clear();
        if input_rate == self.output_rate {
            self.inner = None;
            return Ok(());
        }

        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            self.output_rate as usize,
            CHUNK_SIZE,
            SUB_CHUNKS,
            1,
        )
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
        tracing::debug!(
            from = input_rate,
            to = self.output_rate,
            chunk = inner.input_frames_next(),
            "playback resampler configured"
        );
        self.inner = Some(inner);
        Ok(())
    }
}
