//! ALSA PCM device wrappers for microphone capture and speech playback.
//!
//! Both directions use interleaved 32-bit float samples so frames can be
//! handed to the PCM codec without an intermediate integer pass.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

impl AlsaParams {
    /// Seconds of audio in one period.
    pub fn period_duration(&self) -> f64 {
        self.period_size as f64 / self.sample_rate as f64
    }
}

/// Open a PCM device for capture, asking for one period per analysis frame.
pub fn open_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Capture,
        sample_rate,
        channels,
        Some(period_size),
        "Capture",
    )
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::FloatLE)?;
        hwp.set_channels(channels)?;
        // The wire rate is fixed, so the device must run at exactly this rate.
        hwp.set_rate(sample_rate, ValueOr::Nearest)
            .with_context(|| format!("{} device does not support {} Hz", dir_name, sample_rate))?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    // Start rendering after the first period so the output clock tracks
    // written frames from the beginning.
    if matches!(direction, Direction::Playback) {
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold(period_size as alsa::pcm::Frames)?;
        pcm.sw_params(&swp)?;
    }

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
        period_size,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period={} frames ({:.1} ms)",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
        params.period_duration() * 1000.0,
    );

    Ok((pcm, params))
}
