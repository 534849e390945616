//! Microphone capture.
//!
//! [`CommandMicrophone`] runs an external recorder (by default `arecord`) that
//! writes raw mono S16_LE PCM to stdout and forwards it as an [`AudioTrack`].

use async_trait::async_trait;
use openai_realtime::AudioTrack;
use std::{process::Stdio, sync::Mutex, time::Duration};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// 100 ms of audio at 24 kHz.
const READ_CHUNK_BYTES: usize = 4800;
const FRAME_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum MicError {
    #[error("microphone access was refused")]
    PermissionDenied,
    #[error("microphone did not become live within {0:?}")]
    NotLive(Duration),
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Opens the capture device. A refusal maps to `MicError::PermissionDenied`.
    async fn acquire(&self) -> Result<AudioTrack, MicError>;

    /// Resolves once the acquired track is delivering audio.
    async fn wait_until_live(&self, timeout: Duration) -> Result<(), MicError>;

    /// Stops capture. Safe to call when nothing is acquired.
    fn release(&self);
}

struct Capture {
    live: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

pub struct CommandMicrophone {
    program: String,
    args: Vec<String>,
    sample_rate: u32,
    capture: Mutex<Option<Capture>>,
}

impl CommandMicrophone {
    pub fn new(command: &[String], sample_rate: u32) -> Result<Self, MicError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| MicError::Unavailable("empty capture command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            sample_rate,
            capture: Mutex::new(None),
        })
    }

    /// `arecord` arguments for raw mono PCM16 at `sample_rate`.
    pub fn arecord_command(sample_rate: u32) -> Vec<String> {
        ["arecord", "-q", "-t", "raw", "-f", "S16_LE", "-c", "1", "-r"]
            .into_iter()
            .map(String::from)
            .chain(std::iter::once(sample_rate.to_string()))
            .collect()
    }

    fn capture(&self) -> std::sync::MutexGuard<'_, Option<Capture>> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Microphone for CommandMicrophone {
    async fn acquire(&self) -> Result<AudioTrack, MicError> {
        self.release();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => MicError::PermissionDenied,
                _ => MicError::Unavailable(format!("{}: {e}", self.program)),
            })?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| MicError::Unavailable("recorder has no stdout".to_string()))?;

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (live_tx, live_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            // Owned here so the recorder is killed when the task ends.
            let _child = child;
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            let mut carry = None;
            loop {
                let n = match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "Microphone read failed.");
                        break;
                    }
                };
                live_tx.send_if_modified(|live| !std::mem::replace(live, true));
                let samples = decode_pcm16(&mut carry, &buf[..n]);
                if !samples.is_empty() && frames_tx.send(samples).await.is_err() {
                    debug!("Audio track dropped; stopping capture.");
                    break;
                }
            }
        });

        info!(program = %self.program, sample_rate = self.sample_rate, "Microphone acquired.");
        *self.capture() = Some(Capture {
            live: live_rx,
            task,
        });
        Ok(AudioTrack::new(self.sample_rate, frames_rx))
    }

    async fn wait_until_live(&self, timeout: Duration) -> Result<(), MicError> {
        let mut live = self
            .capture()
            .as_ref()
            .map(|c| c.live.clone())
            .ok_or_else(|| MicError::Unavailable("no track".to_string()))?;

        match tokio::time::timeout(timeout, live.wait_for(|live| *live)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MicError::Unavailable(
                "recorder exited before producing audio".to_string(),
            )),
            Err(_) => Err(MicError::NotLive(timeout)),
        }
    }

    fn release(&self) {
        if let Some(capture) = self.capture().take() {
            capture.task.abort();
            info!("Microphone released.");
        }
    }
}

/// Decodes little-endian PCM16, holding an odd trailing byte for the next read.
fn decode_pcm16(carry: &mut Option<u8>, bytes: &[u8]) -> Vec<i16> {
    let mut joined;
    let bytes = match carry.take() {
        Some(first) => {
            joined = Vec::with_capacity(bytes.len() + 1);
            joined.push(first);
            joined.extend_from_slice(bytes);
            &joined[..]
        }
        None => bytes,
    };
    let chunks = bytes.chunks_exact(2);
    *carry = chunks.remainder().first().copied();
    chunks.map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}
