//! Incremental MP3 decoding for streamed TTS audio
//!
//! `audio_chunk` payloads are arbitrary byte slices of one or more MP3
//! streams. [`Mp3Stream`] holds back incomplete frames until the rest arrives
//! and decodes complete ones with `minimp3`. Each batch is decoded together
//! with the last few frames of the previous batch so Layer III frames that
//! borrow bits from their predecessors still decode cleanly; the samples of
//! those warm-up frames are discarded.

use std::io::Cursor;

use crate::{Error, Result};

/// Frames re-decoded ahead of each batch to restore the bit reservoir
const WARMUP_FRAMES: usize = 2;

const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L3: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Decoded mono audio
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    len: usize,
    samples: usize,
}

/// Parse an MPEG Layer III frame header
fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    let [b0, b1, b2, ..] = *bytes else {
        return None;
    };
    if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
        return None;
    }

    let version = (b1 >> 3) & 0x03;
    let layer = (b1 >> 1) & 0x03;
    if version == 1 || layer != 1 {
        return None;
    }

    let bitrate_index = usize::from(b2 >> 4);
    let rate_index = usize::from((b2 >> 2) & 0x03);
    if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }
    let padding = u32::from((b2 >> 1) & 0x01);

    let mpeg1 = version == 3;
    let (bitrate, sample_rate, coefficient, samples) = if mpeg1 {
        let rates = [44_100, 48_000, 32_000];
        (BITRATES_V1_L3[bitrate_index], rates[rate_index], 144_000, 1152)
    } else {
        let rates = if version == 2 {
            [22_050, 24_000, 16_000]
        } else {
            [11_025, 12_000, 8_000]
        };
        (BITRATES_V2_L3[bitrate_index], rates[rate_index], 72_000, 576)
    };

    let len = coefficient * bitrate / sample_rate + padding;
    Some(FrameHeader {
        len: usize::try_from(len).ok()?,
        samples,
    })
}

/// Length of an ID3v2 tag starting at `bytes`, if one does
fn id3_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return None;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, &b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if bytes[5] & 0x10 == 0 { 0 } else { 10 };
    Some(10 + size + footer)
}

/// Reassembles and decodes a chunked MP3 byte stream
#[derive(Debug, Default)]
pub struct Mp3Stream {
    pending: Vec<u8>,
    warmup: Vec<Vec<u8>>,
}

impl Mp3Stream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes and decode every frame they complete
    ///
    /// # Errors
    ///
    /// Returns error if `minimp3` rejects a complete frame
    pub fn push(&mut self, bytes: &[u8]) -> Result<Decoded> {
        self.pending.extend_from_slice(bytes);
        let (frames, consumed) = self.split_frames();
        self.pending.drain(..consumed);
        self.decode(frames)
    }

    /// Discard partial frames and decoder history
    pub fn reset(&mut self) {
        self.pending.clear();
        self.warmup.clear();
    }

    /// Bytes held back waiting for the rest of a frame
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Split complete frames off the front of `pending`
    fn split_frames(&self) -> (Vec<(Vec<u8>, usize)>, usize) {
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos + 4 <= self.pending.len() {
            let rest = &self.pending[pos..];
            if rest.starts_with(b"ID3") {
                match id3_len(rest) {
                    Some(len) if len <= rest.len() => {
                        pos += len;
                        continue;
                    }
                    _ => break,
                }
            }

            match parse_header(rest) {
                Some(header) if header.len <= rest.len() => {
                    frames.push((rest[..header.len].to_vec(), header.samples));
                    pos += header.len;
                }
                Some(_) => break,
                // not a frame boundary; resync
                None => pos += 1,
            }
        }

        (frames, pos)
    }

    fn decode(&mut self, frames: Vec<(Vec<u8>, usize)>) -> Result<Decoded> {
        if frames.is_empty() {
            return Ok(Decoded::default());
        }

        let fresh_frames = frames.len();
        let mut input: Vec<u8> = self.warmup.concat();
        for (bytes, _) in &frames {
            input.extend_from_slice(bytes);
        }

        let mut decoder = minimp3::Decoder::new(Cursor::new(input));
        let mut decoded: Vec<Vec<f32>> = Vec::new();
        let mut sample_rate = 0;
        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                    decoded.push(to_mono(&frame.data, frame.channels));
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        // the newest frames are always decodable; anything before is warm-up
        let skip = decoded.len().saturating_sub(fresh_frames);
        let samples = decoded.into_iter().skip(skip).flatten().collect();

        let keep_from = frames.len().saturating_sub(WARMUP_FRAMES);
        let mut warmup: Vec<Vec<u8>> = std::mem::take(&mut self.warmup);
        warmup.extend(frames.into_iter().skip(keep_from).map(|(bytes, _)| bytes));
        let excess = warmup.len().saturating_sub(WARMUP_FRAMES);
        warmup.drain(..excess);
        self.warmup = warmup;

        Ok(Decoded {
            samples,
            sample_rate,
        })
    }
}

/// Decode a complete MP3 buffer to mono f32 samples
///
/// # Errors
///
/// Returns error if decoding fails
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Decoded> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut out = Decoded::default();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                out.sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                out.samples.extend(to_mono(&frame.data, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(out)
}

/// Convert interleaved i16 to mono f32, averaging stereo
#[allow(clippy::cast_precision_loss)]
fn to_mono(data: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| f32::from(s) / 32768.0).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
            sum / frame.len() as f32
        })
        .collect()
}
