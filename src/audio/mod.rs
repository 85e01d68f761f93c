//! audio - microphone capture, PCM codec and gapless speech playback
//!
//! Uses ALSA for audio I/O. Capture and rendering each run on a dedicated
//! OS thread; everything they produce is posted back to the session's event
//! loop over channels.

mod alsa_device;
pub mod alsa_output;
pub mod capture;
pub mod pcm;
pub mod playback;

pub use alsa_output::AlsaOutput;
pub use capture::{AlsaMicrophone, CaptureEvent, CapturePipeline, CapturedFrame, FrameSource, VolumeSample};
pub use pcm::{AudioBuffer, AudioFrame, EncodedChunk};
pub use playback::{AudioOutput, PlaybackEvent, PlaybackId, PlaybackScheduler, ScheduledPlayback};
