//! ALSA-backed [`AudioOutput`].
//!
//! A render thread writes one period at a time, mixing whatever scheduled
//! buffers overlap that period and silence elsewhere. The output clock is the
//! mix frontier: the first frame not yet mixed, divided by the sample rate.
//! It advances in real time even while nothing is playing, and a buffer
//! started "now" always lands in the next period to be mixed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::pcm::AudioBuffer;
use super::playback::{AudioOutput, PlaybackEvent, PlaybackId};
use crate::error::{Result, VoiceError};

const MAX_WRITE_RETRIES: u32 = 3;

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    buffer: AudioBuffer,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

struct Shared {
    voices: Mutex<Vec<Voice>>,
    /// First frame not yet mixed. Only advanced with `voices` locked.
    frames_mixed: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            voices: Mutex::new(Vec::new()),
            frames_mixed: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    fn lock_voices(&self) -> MutexGuard<'_, Vec<Voice>> {
        // A poisoned lock only means the render thread died mid-mix; the
        // voice list itself is still consistent.
        self.voices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct AlsaOutput {
    shared: Arc<Shared>,
    sample_rate: u32,
    render_handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    /// Open the playback device and start the render thread. Completions and
    /// device failure are reported on `events`.
    pub fn open(
        device: &str,
        sample_rate: u32,
        period_size: usize,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let period_size_opt = if period_size > 0 { Some(period_size) } else { None };
        let (pcm, params) = alsa_device::open_playback(device, sample_rate, 1, period_size_opt)
            .map_err(|e| VoiceError::DeviceAccess(format!("{:#}", e)))?;

        let shared = Arc::new(Shared::new());
        let actual_rate = params.sample_rate;

        let render_handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = render_thread(pcm, params, &shared, &events) {
                        log::error!("Playback thread error: {:#}", e);
                        if shared.running.load(Ordering::SeqCst) {
                            let err = VoiceError::DeviceAccess(format!("playback failed: {:#}", e));
                            let _ = events.send(PlaybackEvent::Failed(err));
                        }
                    }
                })
                .map_err(|e| VoiceError::DeviceAccess(format!("failed to spawn playback thread: {}", e)))?
        };

        Ok(Self {
            shared,
            sample_rate: actual_rate,
            render_handle: Some(render_handle),
        })
    }

    /// Stop the render thread and close the device.
    pub fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.render_handle.take() {
            if h.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }
}

impl AudioOutput for AlsaOutput {
    fn current_time(&self) -> f64 {
        self.shared.frames_mixed.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: PlaybackId, buffer: AudioBuffer, start_at: f64) -> Result<()> {
        // Durations are measured at the buffer's own rate, so an unresampled
        // buffer would drift off the scheduler's timeline.
        if buffer.sample_rate() != self.sample_rate {
            return Err(VoiceError::MalformedAudio(format!(
                "playback {} is {} Hz but the device runs at {} Hz",
                id,
                buffer.sample_rate(),
                self.sample_rate
            )));
        }
        let requested = (start_at * self.sample_rate as f64).round().max(0.0) as u64;
        let mut voices = self.shared.lock_voices();
        let start_frame = requested.max(self.shared.frames_mixed.load(Ordering::SeqCst));
        voices.push(Voice {
            id,
            start_frame,
            buffer,
        });
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        self.shared.lock_voices().retain(|v| v.id != id);
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

// ======================== Render thread ========================

fn render_thread(
    pcm: PCM,
    params: AlsaParams,
    shared: &Shared,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
) -> anyhow::Result<()> {
    let channels = params.channels as usize;
    let period = params.period_size.max(1);
    let mut period_buf = vec![0.0f32; period * channels];
    let io = pcm.io_f32()?;

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while shared.running.load(Ordering::SeqCst) {
        let completed = render_period(shared, period, channels, &mut period_buf);

        // Write with retry to handle short writes and XRUN recovery.
        let mut frames_done = 0;
        let mut retry_count = 0u32;
        while frames_done < period {
            match io.writei(&period_buf[frames_done * channels..]) {
                Ok(n) => {
                    frames_done += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        anyhow::bail!("failed to recover PCM playback: {}", e2);
                    }
                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_done
                        );
                        break;
                    }
                }
            }
        }

        for id in completed {
            if events.send(PlaybackEvent::Finished(id)).is_err() {
                log::debug!("Playback event receiver dropped");
            }
        }
    }

    let _ = pcm.drop();
    log::info!("Playback stopped");
    Ok(())
}

/// Mix the next period into `out`, advance the mix frontier past it and
/// return the voices that ended within it.
fn render_period(
    shared: &Shared,
    period: usize,
    channels: usize,
    out: &mut [f32],
) -> Vec<PlaybackId> {
    let mut voices = shared.lock_voices();
    let period_start = shared.frames_mixed.load(Ordering::SeqCst);
    let period_end = period_start + period as u64;

    out.fill(0.0);
    mix_period(&voices, period_start, period_end, channels, out);
    shared.frames_mixed.store(period_end, Ordering::SeqCst);

    let mut completed = Vec::new();
    voices.retain(|v| {
        if v.end_frame() <= period_end {
            completed.push(v.id);
            false
        } else {
            true
        }
    });
    completed
}

/// Sum every voice overlapping `[period_start, period_end)` into `out`.
fn mix_period(
    voices: &[Voice],
    period_start: u64,
    period_end: u64,
    channels: usize,
    out: &mut [f32],
) {
    for voice in voices {
        let from = voice.start_frame.max(period_start);
        let to = voice.end_frame().min(period_end);
        if from >= to {
            continue;
        }
        let src_channels = voice.buffer.num_channels();
        for frame in from..to {
            let src = (frame - voice.start_frame) as usize;
            let dst = (frame - period_start) as usize * channels;
            for ch in 0..channels {
                out[dst + ch] += voice.buffer.channel(ch % src_channels)[src];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24000;
    const PERIOD: usize = 1024;

    fn voice(id: u64, start_frame: u64, samples: Vec<f32>) -> Voice {
        Voice {
            id: PlaybackId::from_raw(id),
            start_frame,
            buffer: AudioBuffer::new(RATE, vec![samples]),
        }
    }

    /// An output with no device behind it; the test drives the render loop.
    fn detached_output() -> AlsaOutput {
        AlsaOutput {
            shared: Arc::new(Shared::new()),
            sample_rate: RATE,
            render_handle: None,
        }
    }

    #[test]
    fn back_to_back_voices_fill_a_period_without_gap() {
        let voices = vec![voice(0, 0, vec![0.25; 3]), voice(1, 3, vec![0.5; 3])];
        let mut out = vec![0.0; 6];
        mix_period(&voices, 0, 6, 1, &mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn voice_spanning_periods_is_split() {
        let voices = vec![voice(0, 2, vec![0.1, 0.2, 0.3, 0.4])];
        let mut first = vec![0.0; 4];
        let mut second = vec![0.0; 4];
        mix_period(&voices, 0, 4, 1, &mut first);
        mix_period(&voices, 4, 8, 1, &mut second);
        assert_eq!(first, vec![0.0, 0.0, 0.1, 0.2]);
        assert_eq!(second, vec![0.3, 0.4, 0.0, 0.0]);
    }

    #[test]
    fn mono_voice_is_duplicated_to_stereo_device() {
        let voices = vec![voice(0, 0, vec![0.5, -0.5])];
        let mut out = vec![0.0; 4];
        mix_period(&voices, 0, 2, 2, &mut out);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn buffer_started_now_plays_from_its_first_sample() {
        let mut output = detached_output();
        let mut buf = vec![0.0; PERIOD];

        // Period 0 is mixed and the render thread is now blocked writing it
        assert!(render_period(&output.shared, PERIOD, 1, &mut buf).is_empty());
        assert_eq!(output.current_time(), PERIOD as f64 / RATE as f64);

        let samples: Vec<f32> = (1..=2 * PERIOD).map(|i| i as f32).collect();
        let now = output.current_time();
        output
            .start(PlaybackId::from_raw(0), AudioBuffer::new(RATE, vec![samples.clone()]), now)
            .unwrap();

        let mut played = Vec::new();
        render_period(&output.shared, PERIOD, 1, &mut buf);
        played.extend_from_slice(&buf);
        let completed = render_period(&output.shared, PERIOD, 1, &mut buf);
        played.extend_from_slice(&buf);

        assert_eq!(played, samples);
        assert_eq!(completed, vec![PlaybackId::from_raw(0)]);
    }

    #[test]
    fn start_in_the_already_mixed_past_is_pulled_forward() {
        let mut output = detached_output();
        let mut buf = vec![0.0; PERIOD];
        render_period(&output.shared, PERIOD, 1, &mut buf);
        render_period(&output.shared, PERIOD, 1, &mut buf);

        output
            .start(PlaybackId::from_raw(0), AudioBuffer::new(RATE, vec![vec![0.5; 4]]), 0.0)
            .unwrap();
        render_period(&output.shared, PERIOD, 1, &mut buf);
        assert_eq!(&buf[..5], &[0.5, 0.5, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn mismatched_rate_is_rejected() {
        let mut output = detached_output();
        let err = output
            .start(PlaybackId::from_raw(0), AudioBuffer::new(16000, vec![vec![0.0; 16]]), 0.0)
            .unwrap_err();
        assert!(matches!(err, VoiceError::MalformedAudio(_)));
        assert!(output.shared.lock_voices().is_empty());
    }
}
