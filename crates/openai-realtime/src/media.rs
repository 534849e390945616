//! Microphone audio as handed to the transport, and its PCM16 uplink encoding.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, ResamplerConstructionError, Resampler};
use tokio::sync::mpsc;
use tracing::warn;

/// The realtime API expects mono PCM16 at 24 kHz.
pub const REALTIME_PCM16_SAMPLE_RATE: u32 = 24_000;

const RESAMPLER_CHUNK: usize = 1024;

/// A live local audio source: mono PCM16 frames at `sample_rate`.
///
/// Dropping the track tells the capture side to stop.
#[derive(Debug)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<i16>>,
}

impl AudioTrack {
    pub fn new(sample_rate: u32, frames: mpsc::Receiver<Vec<i16>>) -> Self {
        Self {
            sample_rate,
            frames,
        }
    }
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
}

pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Little-endian PCM16, base64 encoded.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Wire event carrying one chunk of microphone audio.
pub fn append_event(encoded_audio: &str) -> String {
    serde_json::json!({ "type": "input_audio_buffer.append", "audio": encoded_audio }).to_string()
}

/// Converts captured frames into `input_audio_buffer.append` events,
/// resampling to 24 kHz when the capture rate differs.
pub struct Pcm16Uplink {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl Pcm16Uplink {
    pub fn new(input_rate: u32) -> Result<Self, ResamplerConstructionError> {
        let resampler = if input_rate == REALTIME_PCM16_SAMPLE_RATE {
            None
        } else {
            Some(create_resampler(
                input_rate as f64,
                REALTIME_PCM16_SAMPLE_RATE as f64,
                RESAMPLER_CHUNK,
            )?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Returns the wire event for `frame`, or `None` while the resampler is
    /// still buffering a full chunk.
    pub fn push(&mut self, frame: &[i16]) -> Option<String> {
        let Some(resampler) = self.resampler.as_mut() else {
            return (!frame.is_empty()).then(|| append_event(&encode_i16(frame)));
        };

        self.pending.extend(convert_i16_to_f32(frame));
        let mut resampled = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(out) => resampled.extend_from_slice(&out[0]),
                Err(e) => warn!(error = %e, "Dropping audio chunk that failed to resample."),
            }
        }
        (!resampled.is_empty()).then(|| append_event(&encode_i16(&convert_f32_to_i16(&resampled))))
    }
}
