//! Microphone capture pipeline.
//!
//! Runs on a dedicated OS thread (not a tokio task) so blocking ALSA reads
//! never stall the session's event loop. Every frame is handled on its own:
//! level meter → PCM encode → hand-off to the session mailbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use serde::Serialize;
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::pcm::{AudioFrame, EncodedChunk, encode_frame};
use crate::error::{Result, VoiceError};

/// Visualizer level in `[0, 100]` derived from one frame's RMS energy.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct VolumeSample(f32);

impl VolumeSample {
    pub const SILENT: VolumeSample = VolumeSample(0.0);

    pub fn new(level: f32) -> Self {
        if level.is_nan() {
            return Self::SILENT;
        }
        Self(level.clamp(0.0, 100.0))
    }

    /// Scale a frame's RMS by `gain` and cap the result at 100.
    pub fn from_samples(samples: &[f32], gain: f32) -> Self {
        Self::new(rms(samples) * gain)
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Output of one capture callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub chunk: EncodedChunk,
    pub volume: VolumeSample,
}

#[derive(Debug)]
pub enum CaptureEvent {
    Frame(CapturedFrame),
    /// The device failed mid-session; the pipeline has already exited.
    Failed(VoiceError),
}

/// A live input device delivering fixed-size mono frames.
pub trait FrameSource: Send {
    /// Block until the next frame is ready. `Ok(None)` means nothing arrived
    /// within the source's poll interval and the caller should check again.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;
}

// ======================== ALSA microphone ========================

pub struct AlsaMicrophone {
    pcm: PCM,
    params: AlsaParams,
    frame_size: usize,
    read_buf: Vec<f32>,
    accum_buf: Vec<f32>,
}

impl AlsaMicrophone {
    /// Acquire the capture device. Fails with `DeviceAccess` when the device
    /// is missing, busy or cannot run at `sample_rate`.
    pub fn open(device: &str, sample_rate: u32, frame_size: usize) -> Result<Self> {
        let (pcm, params) = alsa_device::open_capture(device, sample_rate, 1, frame_size)
            .map_err(|e| VoiceError::DeviceAccess(format!("{:#}", e)))?;
        let read_buf = vec![0.0f32; params.period_size * params.channels as usize];
        Ok(Self {
            pcm,
            params,
            frame_size,
            read_buf,
            accum_buf: Vec::with_capacity(frame_size * 2),
        })
    }
}

impl FrameSource for AlsaMicrophone {
    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        let channels = self.params.channels as usize;
        while self.accum_buf.len() < self.frame_size {
            let io = self
                .pcm
                .io_f32()
                .map_err(|e| VoiceError::DeviceAccess(e.to_string()))?;
            match io.readi(&mut self.read_buf) {
                Ok(frames) => {
                    // Down-mix to mono if the device insisted on more channels
                    for frame in self.read_buf[..frames * channels].chunks(channels) {
                        let sum: f32 = frame.iter().sum();
                        self.accum_buf.push(sum / channels as f32);
                    }
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    self.pcm.prepare().map_err(|e2| {
                        VoiceError::DeviceAccess(format!("failed to recover capture: {}", e2))
                    })?;
                }
            }
        }

        let samples: Vec<f32> = self.accum_buf.drain(..self.frame_size).collect();
        Ok(Some(AudioFrame {
            samples,
            sample_rate: self.params.sample_rate,
            channels: 1,
        }))
    }
}

// ======================== Pipeline ========================

/// Owns the capture thread and, through it, the input device.
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start pumping frames from `source` into `tx`.
    pub fn start(
        source: Box<dyn FrameSource>,
        volume_gain: f32,
        tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || capture_thread(source, volume_gain, tx, &running))
                .map_err(|e| VoiceError::DeviceAccess(format!("failed to spawn capture thread: {}", e)))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it, which also releases the device.
    /// No frame is delivered after this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    mut source: Box<dyn FrameSource>,
    volume_gain: f32,
    tx: mpsc::UnboundedSender<CaptureEvent>,
    running: &AtomicBool,
) {
    log::info!("Recording started");
    let mut frames_sent: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match source.read_frame() {
            Ok(Some(frame)) => {
                let volume = VolumeSample::from_samples(&frame.samples, volume_gain);
                let chunk = encode_frame(&frame);
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(CaptureEvent::Frame(CapturedFrame { chunk, volume })).is_err() {
                    log::warn!("Capture receiver dropped, stopping");
                    break;
                }
                frames_sent += 1;
            }
            Ok(None) => continue,
            Err(e) => {
                log::error!("Recording thread error: {}", e);
                if running.load(Ordering::SeqCst) {
                    let _ = tx.send(CaptureEvent::Failed(e));
                }
                break;
            }
        }
    }

    // `source` drops here, closing the device before `stop()` returns.
    drop(source);
    log::info!("Recording stopped after {} frames", frames_sent);
}
