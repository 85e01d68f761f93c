//! Gapless scheduling of inbound speech buffers.
//!
//! Buffers are laid back to back on the output clock: each one starts at
//! `max(cursor, now)` and pushes the cursor forward by its duration, so chunks
//! play in arrival order with neither gaps nor overlap regardless of how fast
//! they arrive.

use std::collections::HashSet;
use std::fmt;

use super::pcm::AudioBuffer;
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(u64);

impl PlaybackId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an output device reports back to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The buffer played to its end. Stopped buffers are not reported.
    Finished(PlaybackId),
    /// The device stopped rendering and will report nothing further.
    Failed(VoiceError),
}

/// An output device with its own clock.
///
/// Implementations report on the [`PlaybackEvent`] channel they were
/// constructed with.
pub trait AudioOutput: Send {
    /// Current output clock position in seconds.
    fn current_time(&self) -> f64;

    /// Queue `buffer` to begin at `start_at` on the output clock. A
    /// `start_at` the device has already rendered past begins at the next
    /// unrendered frame instead.
    fn start(&mut self, id: PlaybackId, buffer: AudioBuffer, start_at: f64) -> Result<()>;

    /// Silence `id` immediately, whether or not it has started.
    fn stop(&mut self, id: PlaybackId);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start_at: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start: f64,
    live: HashSet<PlaybackId>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let next_start = output.current_time();
        Self {
            output,
            next_start,
            live: HashSet::new(),
            next_id: 0,
        }
    }

    /// Schedule `buffer` right after everything already queued, or now if the
    /// queue has drained.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Result<ScheduledPlayback> {
        let start_at = self.next_start.max(self.output.current_time());
        let duration = buffer.duration();
        let id = PlaybackId::from_raw(self.next_id);
        self.next_id += 1;

        self.output.start(id, buffer, start_at)?;
        self.next_start = start_at + duration;
        self.live.insert(id);

        log::debug!(
            "Scheduled playback {} at {:.3}s for {:.3}s ({} live)",
            id,
            start_at,
            duration,
            self.live.len()
        );
        Ok(ScheduledPlayback {
            id,
            start_at,
            duration,
        })
    }

    /// Record natural completion of `id`. Returns `true` if this emptied the
    /// live set. Ids that were cancelled or never scheduled are ignored.
    pub fn finished(&mut self, id: PlaybackId) -> bool {
        self.live.remove(&id) && self.live.is_empty()
    }

    /// Stop every live buffer and clear the set. Safe to call repeatedly.
    ///
    /// Cancellation starts a fresh timeline: the cursor is pulled back to the
    /// current clock so the next response does not wait out the cancelled audio.
    /// This is the one place the cursor moves backwards; it is otherwise
    /// non-decreasing.
    pub fn cancel_all(&mut self) {
        if !self.live.is_empty() {
            log::info!("Cancelling {} scheduled playback buffers", self.live.len());
        }
        for id in self.live.drain() {
            self.output.stop(id);
        }
        self.next_start = self.output.current_time();
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}
