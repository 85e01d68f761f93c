//! The voice session actor.
//!
//! One tokio task owns the [`SessionState`] and the playback live set. The
//! capture thread, the network channel, the output device and the caller all
//! post into that task's mailboxes, so every mutation happens in one order.

pub mod state;

use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::audio::pcm::decode_chunk;
use crate::audio::{
    AlsaMicrophone, AlsaOutput, AudioOutput, CaptureEvent, CapturePipeline, CapturedFrame,
    FrameSource, PlaybackEvent, PlaybackId, PlaybackScheduler, VolumeSample,
};
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::ledger::Transaction;
use crate::net_link::NetLink;
use crate::protocol::{InboundEvent, OutboundEvent, ToolCallRequest};
use crate::tools::{CreateTransactionTool, ToolDispatcher};

pub use state::SessionState;

const INBOUND_QUEUE: usize = 100;

/// What the UI renders: the activity state and the latest input level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub volume: VolumeSample,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Connecting,
            volume: VolumeSample::SILENT,
        }
    }
}

#[derive(Debug)]
enum Control {
    Close,
}

/// The devices and channel ends a session runs on. Everything here is owned
/// by the session from spawn until teardown.
pub struct SessionIo {
    pub microphone: Box<dyn FrameSource>,
    pub output: Box<dyn AudioOutput>,
    /// Completions and failures reported by `output`.
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub outbound: mpsc::UnboundedSender<OutboundEvent>,
}

pub struct SessionHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    status_rx: watch::Receiver<SessionStatus>,
    join: JoinHandle<SessionState>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// A stream of status updates for rendering.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Resolves once the session has reached `Closed` or `Errored`.
    pub async fn ended(&self) -> SessionState {
        let mut rx = self.status_rx.clone();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => status.state.clone(),
            // The actor is gone without publishing a terminal state
            Err(_) => SessionState::Errored("session task exited".to_string()),
        }
    }

    /// Close the session and wait for teardown. When this returns the
    /// microphone is stopped, playback is cancelled and both devices are
    /// released. Closing an already finished session just returns its final
    /// state.
    pub async fn close(self) -> SessionState {
        // Fails only if the actor already exited
        let _ = self.control_tx.send(Control::Close);
        match self.join.await {
            Ok(state) => state,
            Err(e) => {
                log::error!("Session task failed: {}", e);
                SessionState::Errored(e.to_string())
            }
        }
    }
}

/// Acquire the audio devices, connect to the service and start a session.
///
/// Must be called from within a Tokio runtime. Fails with `DeviceAccess` if
/// either device cannot be opened; in that case nothing is left running.
pub fn start_session<F>(config: &Config, on_tool_invoked: F) -> Result<SessionHandle>
where
    F: Fn(Transaction) + Send + Sync + 'static,
{
    let microphone = AlsaMicrophone::open(
        &config.capture_device,
        config.input_sample_rate,
        config.frame_size,
    )?;
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let output = AlsaOutput::open(
        &config.playback_device,
        config.output_sample_rate,
        config.playback_period_size,
        playback_tx,
    )?;

    let mut dispatcher = ToolDispatcher::new();
    dispatcher.register_tool(Box::new(CreateTransactionTool::new(on_tool_invoked)));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let link = NetLink::new(
        config.clone(),
        dispatcher.declarations(),
        inbound_tx,
        outbound_rx,
    );
    tokio::spawn(link.run());

    let io = SessionIo {
        microphone: Box::new(microphone),
        output: Box::new(output),
        playback_events: playback_rx,
        inbound: inbound_rx,
        outbound: outbound_tx,
    };
    Ok(VoiceSession::spawn(config, io, dispatcher))
}

pub struct VoiceSession {
    state: SessionState,
    volume: VolumeSample,
    status_tx: watch::Sender<SessionStatus>,

    /// Held until the channel opens, then moved into `capture`.
    microphone: Option<Box<dyn FrameSource>>,
    capture: Option<CapturePipeline>,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    scheduler: Option<PlaybackScheduler>,
    dispatcher: ToolDispatcher,
    outbound: mpsc::UnboundedSender<OutboundEvent>,

    volume_gain: f32,
    debounce_delay: Duration,
    /// Armed when the live set empties while speaking.
    debounce: Option<Pin<Box<Sleep>>>,
}

impl VoiceSession {
    /// Spawn the actor on the current runtime.
    pub fn spawn(config: &Config, io: SessionIo, dispatcher: ToolDispatcher) -> SessionHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();

        let session = VoiceSession {
            state: SessionState::Connecting,
            volume: VolumeSample::SILENT,
            status_tx,
            microphone: Some(io.microphone),
            capture: None,
            capture_tx,
            scheduler: Some(PlaybackScheduler::new(io.output)),
            dispatcher,
            outbound: io.outbound,
            volume_gain: config.volume_gain,
            debounce_delay: Duration::from_millis(config.speaking_debounce_ms),
            debounce: None,
        };

        let join = tokio::spawn(session.run(control_rx, capture_rx, io.inbound, io.playback_events));
        SessionHandle {
            control_tx,
            status_rx,
            join,
        }
    }

    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) -> SessionState {
        log::info!("Voice session started. State: {}", self.state);

        while !self.state.is_terminal() {
            tokio::select! {
                biased;

                cmd = control_rx.recv() => match cmd {
                    Some(Control::Close) => self.close().await,
                    None => {
                        log::info!("Session handle dropped, closing");
                        self.close().await;
                    }
                },

                Some(event) = capture_rx.recv() => self.handle_capture_event(event).await,

                event = inbound.recv() => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => {
                        let err = VoiceError::Channel("inbound channel closed".to_string());
                        self.fail(err.to_string()).await;
                    }
                },

                Some(event) = playback_events.recv() => match event {
                    PlaybackEvent::Finished(id) => self.handle_playback_finished(id),
                    PlaybackEvent::Failed(err) => {
                        log::error!("Speaker failed: {}", err);
                        self.fail(err.to_string()).await;
                    }
                },

                _ = debounce_elapsed(&mut self.debounce) => self.handle_debounce_elapsed(),
            }
        }

        log::info!("Voice session ended. State: {}", self.state);
        self.state
    }

    // ======================== Capture ========================

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(CapturedFrame { chunk, volume }) => {
                if !self.state.is_open() {
                    return;
                }
                log::trace!("Sending {} bytes of captured audio", chunk.data.len());
                if self.outbound.send(OutboundEvent::Audio(chunk)).is_err() {
                    let err = VoiceError::Channel("outbound channel closed".to_string());
                    self.fail(err.to_string()).await;
                    return;
                }
                self.volume = volume;
                self.publish();
            }
            CaptureEvent::Failed(err) => {
                log::error!("Microphone failed: {}", err);
                self.fail(err.to_string()).await;
            }
        }
    }

    // ======================== Inbound ========================

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::SessionOpened => {
                if self.state == SessionState::Connecting {
                    self.open().await;
                } else {
                    log::debug!("Ignoring repeated session open in state {}", self.state);
                }
            }
            InboundEvent::AudioDelta {
                data,
                sample_rate,
                channels,
            } => {
                if !self.ensure_open().await {
                    return;
                }
                self.handle_audio_delta(&data, sample_rate, channels).await;
            }
            InboundEvent::ToolCallRequest(request) => {
                if !self.ensure_open().await {
                    return;
                }
                self.handle_tool_call(request).await;
            }
            InboundEvent::Interrupted => {
                log::info!("Response interrupted, cancelling playback");
                self.debounce = None;
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.cancel_all();
                }
                if self.state == SessionState::Speaking {
                    self.transition(SessionState::Listening);
                }
            }
            InboundEvent::SessionClosed => {
                log::info!("Service closed the session");
                self.teardown().await;
                self.transition(SessionState::Closed);
            }
            InboundEvent::SessionError(reason) => {
                log::error!("Session error from service: {}", reason);
                self.fail(reason).await;
            }
        }
    }

    async fn handle_audio_delta(&mut self, data: &str, sample_rate: u32, channels: u16) {
        let buffer = match decode_chunk(data, sample_rate, channels) {
            Ok(buffer) => buffer,
            Err(err) => {
                log::warn!("Dropping inbound audio: {}", err);
                return;
            }
        };
        if buffer.is_empty() {
            return;
        }
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };

        self.debounce = None;
        match scheduler.schedule(buffer) {
            Ok(_) => self.transition(SessionState::Speaking),
            Err(err) if err.is_fatal() => {
                log::error!("Playback device failed: {}", err);
                self.fail(err.to_string()).await;
            }
            Err(err) => log::warn!("Dropping inbound audio: {}", err),
        }
    }

    async fn handle_tool_call(&mut self, request: ToolCallRequest) {
        log::info!("Tool call {} ({})", request.id, request.name);
        self.transition(SessionState::Processing);

        if let Some(result) = self.dispatcher.dispatch(&request).await {
            if self.outbound.send(OutboundEvent::ToolResult(result)).is_err() {
                let err = VoiceError::Channel("outbound channel closed".to_string());
                self.fail(err.to_string()).await;
                return;
            }
        }

        let audio_pending = self.scheduler.as_ref().is_some_and(|s| !s.is_idle());
        if audio_pending {
            self.transition(SessionState::Speaking);
        } else {
            self.transition(SessionState::Listening);
        }
    }

    // ======================== Playback ========================

    fn handle_playback_finished(&mut self, id: PlaybackId) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        if scheduler.finished(id) {
            log::debug!("Playback drained after {}", id);
            self.debounce = Some(Box::pin(tokio::time::sleep(self.debounce_delay)));
        }
    }

    fn handle_debounce_elapsed(&mut self) {
        self.debounce = None;
        let idle = self.scheduler.as_ref().is_none_or(|s| s.is_idle());
        if idle && self.state == SessionState::Speaking {
            self.transition(SessionState::Listening);
        }
    }

    // ======================== Lifecycle ========================

    /// Start capture and move to `Listening`. Capture never starts before the
    /// channel is open.
    async fn open(&mut self) {
        let Some(microphone) = self.microphone.take() else {
            return;
        };
        match CapturePipeline::start(microphone, self.volume_gain, self.capture_tx.clone()) {
            Ok(capture) => {
                self.capture = Some(capture);
                self.transition(SessionState::Listening);
            }
            Err(err) => {
                log::error!("Failed to start capture: {}", err);
                self.fail(err.to_string()).await;
            }
        }
    }

    /// Some services stream before acknowledging setup. Treat that as an
    /// implicit open. Returns `false` if the session cannot accept events.
    async fn ensure_open(&mut self) -> bool {
        if self.state == SessionState::Connecting {
            log::warn!("Received content before the session was opened, opening now");
            self.open().await;
        }
        self.state.is_open()
    }

    async fn close(&mut self) {
        log::info!("Closing session");
        let _ = self.outbound.send(OutboundEvent::Close);
        self.teardown().await;
        self.transition(SessionState::Closed);
    }

    async fn fail(&mut self, reason: String) {
        self.teardown().await;
        self.transition(SessionState::Errored(reason));
    }

    /// Stop capture, cancel playback and release both devices. Returns only
    /// after the capture thread has exited.
    async fn teardown(&mut self) {
        self.debounce = None;
        self.volume = VolumeSample::SILENT;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.cancel_all();
        }

        let capture = self.capture.take();
        let microphone = self.microphone.take();
        let scheduler = self.scheduler.take();
        if capture.is_none() && microphone.is_none() && scheduler.is_none() {
            return;
        }
        // Joining device threads blocks, keep it off the runtime workers
        let released = tokio::task::spawn_blocking(move || {
            if let Some(mut capture) = capture {
                capture.stop();
            }
            drop(microphone);
            drop(scheduler);
        })
        .await;
        if let Err(e) = released {
            log::error!("Failed to release audio devices: {}", e);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(&next) {
            log::warn!("Ignoring illegal transition {} -> {}", self.state, next);
            return;
        }
        log::info!("Session state: {} -> {}", self.state, next);
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(SessionStatus {
            state: self.state.clone(),
            volume: self.volume,
        });
    }
}

async fn debounce_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::{AudioBuffer, AudioFrame, encode_samples};
    use crate::ledger::Account;
    use crate::protocol::ToolStatus;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Map, Value, json};
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex};

    struct ChannelSource(std_mpsc::Receiver<AudioFrame>);

    impl FrameSource for ChannelSource {
        fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
            match self.0.recv_timeout(std::time::Duration::from_millis(5)) {
                Ok(frame) => Ok(Some(frame)),
                Err(_) => Ok(None),
            }
        }
    }

    #[derive(Default)]
    struct OutputLog {
        started: Vec<PlaybackId>,
        stopped: Vec<PlaybackId>,
    }

    struct FakeOutput(Arc<Mutex<OutputLog>>);

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn start(&mut self, id: PlaybackId, _buffer: AudioBuffer, _start_at: f64) -> Result<()> {
            self.0.lock().unwrap().started.push(id);
            Ok(())
        }

        fn stop(&mut self, id: PlaybackId) {
            self.0.lock().unwrap().stopped.push(id);
        }
    }

    struct Harness {
        handle: SessionHandle,
        frames: std_mpsc::Sender<AudioFrame>,
        inbound: mpsc::Sender<InboundEvent>,
        outbound: mpsc::UnboundedReceiver<OutboundEvent>,
        playback: mpsc::UnboundedSender<PlaybackEvent>,
        output: Arc<Mutex<OutputLog>>,
        committed: Arc<Mutex<Vec<Transaction>>>,
    }

    fn harness() -> Harness {
        let (frames, frame_rx) = std_mpsc::channel();
        let (inbound, inbound_rx) = mpsc::channel(16);
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (playback, playback_rx) = mpsc::unbounded_channel();
        let output = Arc::new(Mutex::new(OutputLog::default()));
        let committed = Arc::new(Mutex::new(Vec::new()));

        let sink = committed.clone();
        let mut dispatcher = ToolDispatcher::new();
        dispatcher.register_tool(Box::new(CreateTransactionTool::new(move |tx| {
            sink.lock().unwrap().push(tx)
        })));

        let io = SessionIo {
            microphone: Box::new(ChannelSource(frame_rx)),
            output: Box::new(FakeOutput(output.clone())),
            playback_events: playback_rx,
            inbound: inbound_rx,
            outbound: outbound_tx,
        };
        let handle = VoiceSession::spawn(&Config::default(), io, dispatcher);
        Harness {
            handle,
            frames,
            inbound,
            outbound,
            playback,
            output,
            committed,
        }
    }

    async fn wait_for_state(handle: &SessionHandle, expected: SessionState) {
        let mut rx = handle.subscribe();
        rx.wait_for(|s| s.state == expected).await.unwrap();
    }

    fn speech(samples: usize) -> InboundEvent {
        InboundEvent::AudioDelta {
            data: STANDARD.encode(encode_samples(&vec![0.1; samples])),
            sample_rate: 24000,
            channels: 1,
        }
    }

    fn tool_call(id: &str, args: Value) -> InboundEvent {
        let arguments: Map<String, Value> = args.as_object().cloned().unwrap();
        InboundEvent::ToolCallRequest(ToolCallRequest {
            id: id.to_string(),
            name: "createTransaction".to_string(),
            arguments,
        })
    }

    fn silent_frame() -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; 4096],
            sample_rate: 16000,
            channels: 1,
        }
    }

    async fn next_non_audio(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
        loop {
            match rx.recv().await.unwrap() {
                OutboundEvent::Audio(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn capture_starts_only_once_opened() {
        let mut h = harness();
        assert_eq!(h.handle.status().state, SessionState::Connecting);

        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        wait_for_state(&h.handle, SessionState::Listening).await;

        h.frames.send(silent_frame()).unwrap();
        match h.outbound.recv().await.unwrap() {
            OutboundEvent::Audio(chunk) => {
                assert_eq!(STANDARD.decode(&chunk.data).unwrap(), vec![0u8; 8192]);
                assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
            }
            other => panic!("unexpected outbound event: {:?}", other),
        }

        h.handle.close().await;
    }

    #[tokio::test]
    async fn tool_call_without_audio_returns_to_listening() {
        let mut h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound
            .send(tool_call("t1", json!({"title": "Uber", "amount": 40, "type": "expense"})))
            .await
            .unwrap();

        match next_non_audio(&mut h.outbound).await {
            OutboundEvent::ToolResult(result) => {
                assert_eq!(result.id, "t1");
                assert_eq!(result.status, ToolStatus::Ok);
            }
            other => panic!("unexpected outbound event: {:?}", other),
        }
        wait_for_state(&h.handle, SessionState::Listening).await;

        let committed = h.committed.lock().unwrap().clone();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].account_origin, Account::Pf);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn invalid_arguments_are_answered_without_commit() {
        let mut h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound
            .send(tool_call("t2", json!({"title": "Uber", "type": "expense"})))
            .await
            .unwrap();

        match next_non_audio(&mut h.outbound).await {
            OutboundEvent::ToolResult(result) => {
                assert_eq!(result.id, "t2");
                assert!(!result.is_ok());
            }
            other => panic!("unexpected outbound event: {:?}", other),
        }
        wait_for_state(&h.handle, SessionState::Listening).await;
        assert!(h.committed.lock().unwrap().is_empty());

        assert_eq!(h.handle.close().await, SessionState::Closed);
        assert!(matches!(
            next_non_audio(&mut h.outbound).await,
            OutboundEvent::Close
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn speaking_ends_after_debounce() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(2400)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        let id = h.output.lock().unwrap().started[0];
        h.playback.send(PlaybackEvent::Finished(id)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.handle.status().state, SessionState::Speaking);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.handle.status().state, SessionState::Listening);

        h.handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_delta_during_debounce_keeps_speaking() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(2400)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        let first = h.output.lock().unwrap().started[0];
        h.playback.send(PlaybackEvent::Finished(first)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.inbound.send(speech(2400)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.handle.status().state, SessionState::Speaking);
        assert_eq!(h.output.lock().unwrap().started.len(), 2);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn malformed_audio_is_dropped() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        wait_for_state(&h.handle, SessionState::Listening).await;

        h.inbound
            .send(InboundEvent::AudioDelta {
                data: STANDARD.encode([1u8, 2, 3]),
                sample_rate: 24000,
                channels: 1,
            })
            .await
            .unwrap();
        h.inbound
            .send(InboundEvent::AudioDelta {
                data: "not base64!".to_string(),
                sample_rate: 24000,
                channels: 1,
            })
            .await
            .unwrap();
        // A valid delta behind the bad ones still plays
        h.inbound.send(speech(240)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;
        assert_eq!(h.output.lock().unwrap().started.len(), 1);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn interruption_cancels_playback() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(2400)).await.unwrap();
        h.inbound.send(speech(2400)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        h.inbound.send(InboundEvent::Interrupted).await.unwrap();
        wait_for_state(&h.handle, SessionState::Listening).await;

        let log = h.output.lock().unwrap();
        let mut stopped = log.stopped.clone();
        stopped.sort();
        assert_eq!(stopped, log.started);
        drop(log);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn close_is_final_and_cancels_playback() {
        let mut h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(24000)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        let output = h.output.clone();
        assert_eq!(h.handle.close().await, SessionState::Closed);
        assert_eq!(output.lock().unwrap().stopped.len(), 1);

        // Nothing is captured after close
        let _ = h.frames.send(silent_frame());
        while let Some(event) = h.outbound.recv().await {
            assert!(!matches!(event, OutboundEvent::Audio(_)));
        }
    }

    #[tokio::test]
    async fn session_error_is_terminal() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound
            .send(InboundEvent::SessionError("quota exceeded".into()))
            .await
            .unwrap();

        assert_eq!(
            h.handle.ended().await,
            SessionState::Errored("quota exceeded".into())
        );
        // Late events are ignored once terminal
        let _ = h.inbound.send(speech(240)).await;
        assert_eq!(
            h.handle.close().await,
            SessionState::Errored("quota exceeded".into())
        );
    }

    #[tokio::test]
    async fn dropped_channel_errors_the_session() {
        let Harness { handle, inbound, .. } = harness();
        drop(inbound);
        match handle.ended().await {
            SessionState::Errored(reason) => assert!(reason.contains("channel")),
            other => panic!("unexpected state: {}", other),
        }
    }

    #[tokio::test]
    async fn speech_before_setup_ack_opens_the_session() {
        let mut h = harness();
        h.inbound.send(speech(2400)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;
        assert_eq!(h.output.lock().unwrap().started.len(), 1);

        // Capture was started on the way through Listening
        h.frames.send(silent_frame()).unwrap();
        assert!(matches!(
            h.outbound.recv().await.unwrap(),
            OutboundEvent::Audio(_)
        ));

        h.handle.close().await;
    }

    #[tokio::test]
    async fn tool_call_before_setup_ack_is_dispatched() {
        let mut h = harness();
        h.inbound
            .send(tool_call("t0", json!({"title": "Pix", "amount": 10, "type": "income"})))
            .await
            .unwrap();

        match next_non_audio(&mut h.outbound).await {
            OutboundEvent::ToolResult(result) => assert_eq!(result.id, "t0"),
            other => panic!("unexpected outbound event: {:?}", other),
        }
        wait_for_state(&h.handle, SessionState::Listening).await;
        assert_eq!(h.committed.lock().unwrap().len(), 1);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn tool_call_during_playback_returns_to_speaking() {
        let mut h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(24000)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        h.inbound
            .send(tool_call("t5", json!({"title": "Uber", "amount": 40, "type": "expense"})))
            .await
            .unwrap();
        match next_non_audio(&mut h.outbound).await {
            OutboundEvent::ToolResult(result) => assert_eq!(result.id, "t5"),
            other => panic!("unexpected outbound event: {:?}", other),
        }

        // The result is sent from Processing; whatever follows must be Speaking
        let mut rx = h.handle.subscribe();
        let state = rx
            .wait_for(|s| s.state != SessionState::Processing)
            .await
            .unwrap()
            .state
            .clone();
        assert_eq!(state, SessionState::Speaking);
        assert!(h.output.lock().unwrap().stopped.is_empty());

        h.handle.close().await;
    }

    #[tokio::test]
    async fn speaker_failure_errors_the_session() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(speech(2400)).await.unwrap();
        wait_for_state(&h.handle, SessionState::Speaking).await;

        let err = VoiceError::DeviceAccess("playback failed: device unplugged".into());
        h.playback.send(PlaybackEvent::Failed(err.clone())).unwrap();

        assert_eq!(h.handle.ended().await, SessionState::Errored(err.to_string()));
        assert_eq!(h.output.lock().unwrap().stopped.len(), 1);
    }

    #[tokio::test]
    async fn service_close_marks_closed() {
        let h = harness();
        h.inbound.send(InboundEvent::SessionOpened).await.unwrap();
        h.inbound.send(InboundEvent::SessionClosed).await.unwrap();
        assert_eq!(h.handle.ended().await, SessionState::Closed);
    }
}
