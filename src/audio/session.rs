//! # Voice Session Management
//!
//! Owns the lifecycle of one live voice session: connect, stream both ways,
//! handle interruptions and mute, report errors, and release every resource
//! deterministically.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: No session
//! 2. **Connecting**: Contexts and microphone acquired, handshake in flight
//! 3. **Connected**: Setup sent, microphone frames flowing
//! 4. **Closed**: The endpoint ended the session
//! 5. **Error**: Something fatal happened; the message stays until the next
//!    start or an explicit dismissal
//!
//! ## Event Queue:
//! Hardware callbacks, the socket task and the recognizer never touch the
//! controller directly. They post [`Envelope`]s into one unbounded channel
//! which a single task drains into [`SessionController::handle`]. Each envelope
//! carries the generation of the session that produced it, so anything left
//! over from a previous session is ignored.

use crate::audio::capture::{self, CaptureStats};
use crate::audio::codec;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::{
    AudioBackend, AudioContext, BufferId, MediaStream, OutputContext, PlaybackBuffer, ProcessorNode,
};
use crate::config::{AppConfig, Credentials};
use crate::error::{VoiceError, VoiceResult};
use crate::state::{MicIndicator, Presence, SessionMetrics, VoiceStatus};
use crate::transcription::{Caption, TranscriptEvent, TranscriptionShadow};
use crate::websocket::{LiveConnector, LiveSessionHandle, LiveSessionRequest, ServerMessage};

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Current state of the controller.
///
/// ## Rust Concepts:
/// - **Copy**: Small enum, passed around by value
/// - **Serialize**: Included in the status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session
    Idle,
    /// Handshake in flight
    Connecting,
    /// Streaming both ways
    Connected,
    /// Session failed (terminal for that session)
    Error,
    /// The endpoint closed the session (terminal for that session)
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        }
    }

    /// Whether a session currently holds resources.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

/// Something that happened outside the controller.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake finished and setup was sent
    Opened,
    /// A message from the live endpoint
    Message(ServerMessage),
    /// The transport failed
    TransportFailed(VoiceError),
    /// The endpoint closed the session
    Closed { reason: Option<String> },
    /// A session playback buffer finished
    PlaybackEnded(BufferId),
    /// A read-aloud buffer finished
    ReadAloudEnded(BufferId),
    /// Local recognizer output
    Transcript(TranscriptEvent),
}

/// An event tagged with the generation that produced it.
#[derive(Debug)]
pub struct Envelope {
    pub generation: u64,
    pub event: SessionEvent,
}

/// Posts events for one generation into the controller queue.
///
/// Cheap to clone; safe to move into audio and network threads.
#[derive(Debug, Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { generation, tx }
    }

    /// Post an event. Returns false once the controller is gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Everything one session holds. Released together, never piecemeal.
#[derive(Default)]
struct SessionResources {
    input: Option<Box<dyn AudioContext>>,
    output: Option<Box<dyn OutputContext>>,
    microphone: Option<Box<dyn MediaStream>>,
    processor: Option<Box<dyn ProcessorNode>>,
    handle: Option<Box<dyn LiveSessionHandle>>,
    capture_stats: Option<Arc<CaptureStats>>,
}

/// One-shot playback for read-aloud, separate from the live session.
struct ReadAloud {
    output: Box<dyn OutputContext>,
    scheduler: PlaybackScheduler,
}

/// Controller for live voice sessions.
///
/// ## Generic Parameters:
/// - **B**: Audio hardware (`CpalBackend` on desktop, fakes in tests)
/// - **C**: Live endpoint connector (`WebSocketConnector`, fakes in tests)
pub struct SessionController<B: AudioBackend, C: LiveConnector> {
    config: AppConfig,
    credentials: Credentials,
    backend: B,
    connector: C,
    shadow: Box<dyn TranscriptionShadow>,

    events: mpsc::UnboundedSender<Envelope>,
    generation: u64,
    read_aloud_generation: u64,

    state: SessionState,
    last_error: Option<VoiceError>,
    muted: bool,

    resources: SessionResources,
    scheduler: PlaybackScheduler,
    caption: Caption,
    metrics: SessionMetrics,
    read_aloud: Option<ReadAloud>,
    /// Token of the read-aloud request whose speech is still being generated
    pending_speech: Option<u64>,
    speech_requests: u64,
}

impl<B: AudioBackend, C: LiveConnector> SessionController<B, C> {
    /// Create a controller and the queue it must be fed from.
    pub fn new(
        config: AppConfig,
        credentials: Credentials,
        backend: B,
        connector: C,
        shadow: Box<dyn TranscriptionShadow>,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            credentials,
            backend,
            connector,
            shadow,
            events,
            generation: 0,
            read_aloud_generation: 0,
            state: SessionState::Idle,
            last_error: None,
            muted: false,
            resources: SessionResources::default(),
            scheduler: PlaybackScheduler::new(),
            caption: Caption::default(),
            metrics: SessionMetrics::new(),
            read_aloud: None,
            pending_speech: None,
            speech_requests: 0,
        };
        (controller, rx)
    }

    /// Start a fresh session.
    ///
    /// ## Steps:
    /// 1. Release anything left from a previous session, clear the last error
    /// 2. Fail fast without touching hardware if no API key is configured
    /// 3. Open the input and output contexts, acquire the microphone
    /// 4. Start the transcription shadow (failures ignored)
    /// 5. Begin the handshake; `Opened` arrives later through the queue
    ///
    /// Any failure tears everything down and leaves the controller in `Error`.
    pub fn start(&mut self) -> VoiceResult<()> {
        self.teardown();
        self.stop_read_aloud();
        self.last_error = None;
        self.generation += 1;
        self.muted = false;
        self.metrics = SessionMetrics::new();

        let api_key = match self.credentials.api_key() {
            Some(key) => key.to_string(),
            None => {
                return Err(self.fail(VoiceError::Config(
                    "API Key missing from environment.".to_string(),
                )))
            }
        };

        let request = match self.config.voice() {
            Ok(voice) => LiveSessionRequest {
                endpoint: self.config.live.endpoint.clone(),
                model: self.config.live.model.clone(),
                voice,
                system_instruction: self.config.live.system_instruction.clone(),
                api_key,
                outbound_queue_frames: self.config.audio.outbound_queue_frames,
            },
            Err(e) => return Err(self.fail(VoiceError::Config(e.to_string()))),
        };

        self.state = SessionState::Connecting;
        info!(
            session_id = %self.metrics.session_id,
            generation = self.generation,
            voice = %request.voice,
            "Starting voice session"
        );

        if let Err(e) = self.acquire(request) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    /// Acquire the resource bundle and begin the handshake.
    fn acquire(&mut self, request: LiveSessionRequest) -> VoiceResult<()> {
        let input_rate = self.config.audio.input_sample_rate;
        let output_rate = self.config.audio.output_sample_rate;

        self.resources.input = Some(self.backend.open_input(input_rate)?);

        let ended = self.event_sender();
        self.resources.output = Some(self.backend.open_output(
            output_rate,
            Box::new(move |id| {
                ended.send(SessionEvent::PlaybackEnded(id));
            }),
        )?);

        self.resources.microphone = Some(self.backend.request_microphone(input_rate)?);
        debug!("Microphone acquired");

        let transcripts = self.event_sender();
        let sink = Box::new(move |event| {
            transcripts.send(SessionEvent::Transcript(event));
        });
        if let Err(e) = self.shadow.start(sink) {
            warn!(detail = e.detail(), "Transcription shadow failed to start, continuing without captions");
        }

        let events = self.event_sender();
        self.resources.handle = Some(self.connector.connect(request, events)?);
        Ok(())
    }

    /// Stop the session unconditionally and return to `Idle`.
    ///
    /// In-flight connection attempts, queued buffers and pending events are
    /// abandoned. Stopping also dismisses the last error.
    pub fn stop(&mut self) {
        self.teardown();
        self.generation += 1;
        self.state = SessionState::Idle;
        self.last_error = None;
        info!(
            session_id = %self.metrics.session_id,
            duration_secs = self.metrics.duration_seconds(),
            "Voice session stopped"
        );
    }

    /// Process one event from the queue.
    pub fn handle(&mut self, envelope: Envelope) {
        let Envelope { generation, event } = envelope;

        match event {
            SessionEvent::ReadAloudEnded(id) => {
                if generation == self.read_aloud_generation {
                    self.on_read_aloud_ended(id);
                }
            }
            _ if generation != self.generation => {
                debug!(generation, current = self.generation, "Ignoring event from a previous session");
            }
            SessionEvent::Opened => self.on_open(),
            SessionEvent::Message(message) => self.on_message(message),
            SessionEvent::TransportFailed(err) => {
                if !err.is_fatal() {
                    self.metrics.decode_errors += 1;
                    warn!(kind = err.kind(), detail = err.detail(), "Ignoring non-fatal transport error");
                } else if self.state == SessionState::Error {
                    debug!(detail = err.detail(), "Ignoring transport error after session failure");
                } else {
                    self.fail(err);
                }
            }
            SessionEvent::Closed { reason } => self.on_close(reason),
            SessionEvent::PlaybackEnded(id) => {
                self.scheduler.on_ended(id);
            }
            SessionEvent::Transcript(event) => {
                if self.state.is_active() {
                    self.caption.apply(event);
                }
            }
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = self.state.as_str(), "Ignoring open outside of connecting");
            return;
        }
        self.state = SessionState::Connected;
        info!(session_id = %self.metrics.session_id, "Voice session connected");

        let sender = match self.resources.handle.as_ref() {
            Some(handle) => handle.audio_sender(),
            None => return,
        };
        self.resources.capture_stats = Some(sender.stats());

        let frame_size = self.config.audio.frame_size;
        let attached = match self.resources.microphone.as_mut() {
            Some(microphone) => capture::attach(microphone.as_mut(), frame_size, sender),
            None => Err(VoiceError::Audio("microphone was released".to_string())),
        };

        match attached {
            Ok(node) => self.resources.processor = Some(node),
            Err(e) => {
                self.fail(e);
            }
        }
    }

    fn on_message(&mut self, message: ServerMessage) {
        if !self.state.is_active() {
            return;
        }

        if message.is_setup_complete() {
            debug!("Setup acknowledged");
        }

        if let Some(data) = message.audio_payload() {
            match codec::decode(data, self.config.audio.output_sample_rate) {
                Ok(buffer) => {
                    if let Some(output) = self.resources.output.as_mut() {
                        match self.scheduler.enqueue(output.as_mut(), buffer) {
                            Ok(_) => self.metrics.buffers_scheduled += 1,
                            Err(e) => warn!(detail = e.detail(), "Failed to schedule playback buffer"),
                        }
                    }
                }
                Err(e) => {
                    self.metrics.decode_errors += 1;
                    warn!(detail = e.detail(), "Dropping malformed audio frame");
                }
            }
        }

        if message.is_interrupted() {
            let stopped = match self.resources.output.as_mut() {
                Some(output) => self.scheduler.flush(output.as_mut()),
                None => {
                    self.scheduler.reset();
                    0
                }
            };
            self.metrics.interruptions += 1;
            info!(stopped, "Model interrupted, playback flushed");
        }

        if message.is_turn_complete() {
            debug!("Model turn complete");
        }

        if let Some(go_away) = &message.go_away {
            info!(time_left = ?go_away.time_left, "Endpoint announced disconnect");
        }
    }

    fn on_close(&mut self, reason: Option<String>) {
        if !self.state.is_active() {
            debug!(state = self.state.as_str(), "Ignoring close outside of an active session");
            return;
        }
        info!(
            reason = ?reason,
            duration_secs = self.metrics.duration_seconds(),
            "Voice session closed by endpoint"
        );
        self.teardown();
        self.state = SessionState::Closed;
    }

    /// The single path for fatal errors: tear down, record, report.
    fn fail(&mut self, err: VoiceError) -> VoiceError {
        error!(
            session_id = %self.metrics.session_id,
            kind = err.kind(),
            detail = err.detail(),
            "Voice session failed"
        );
        self.teardown();
        self.state = SessionState::Error;
        self.last_error = Some(err.clone());
        err
    }

    /// Release every resource the session holds. Idempotent.
    fn teardown(&mut self) {
        let resources = &mut self.resources;

        if let Some(mut handle) = resources.handle.take() {
            handle.close();
        }
        self.shadow.stop();
        if let Some(mut processor) = resources.processor.take() {
            processor.disconnect();
        }
        if let Some(mut microphone) = resources.microphone.take() {
            microphone.stop_tracks();
        }
        match resources.output.as_mut() {
            Some(output) => {
                self.scheduler.flush(output.as_mut());
            }
            None => self.scheduler.reset(),
        }
        if let Some(mut output) = resources.output.take() {
            output.close();
        }
        if let Some(mut input) = resources.input.take() {
            input.close();
        }
        if let Some(stats) = resources.capture_stats.take() {
            self.metrics.frames_sent = stats.frames_sent();
            self.metrics.frames_dropped = stats.frames_dropped();
        }
        self.caption.clear();
        self.muted = false;
    }

    /// Toggle the microphone track. Returns the new muted state.
    ///
    /// Without a live microphone there is nothing to mute and the state is
    /// left unchanged.
    pub fn toggle_mute(&mut self) -> bool {
        let Some(microphone) = self.resources.microphone.as_mut() else {
            debug!("No microphone to mute");
            return self.muted;
        };
        let muted = !self.muted;
        if let Err(e) = microphone.set_enabled(!muted) {
            warn!(detail = e.detail(), "Failed to toggle microphone");
            return self.muted;
        }
        self.muted = muted;
        info!(muted, "Microphone toggled");
        self.muted
    }

    /// Clear the visible error. A failed session returns to `Idle`.
    pub fn dismiss_error(&mut self) {
        self.last_error = None;
        if self.state == SessionState::Error {
            self.state = SessionState::Idle;
        }
    }

    /// Apply a partial JSON config update (e.g. a new voice for the next session).
    pub fn update_config(&mut self, json: &str) -> anyhow::Result<()> {
        self.config.update_from_json(json)
    }

    /// Begin a read-aloud request and return its token.
    ///
    /// Anything already playing or being generated is stopped first. Not
    /// available while a live session is connecting or connected.
    pub fn request_read_aloud(&mut self) -> VoiceResult<u64> {
        if self.state.is_active() {
            return Err(VoiceError::Config(
                "Read-aloud is unavailable during a voice session.".to_string(),
            ));
        }
        self.stop_read_aloud();
        self.speech_requests += 1;
        self.pending_speech = Some(self.speech_requests);
        debug!(request = self.speech_requests, "Read-aloud requested");
        Ok(self.speech_requests)
    }

    /// Play the synthesized speech for `request`.
    ///
    /// Returns `Ok(false)` when the request was superseded, cancelled or a
    /// live session started in the meantime; the speech is then discarded.
    pub fn play_read_aloud(&mut self, request: u64, buffer: PlaybackBuffer) -> VoiceResult<bool> {
        if self.pending_speech != Some(request) || self.state.is_active() {
            debug!(request, "Discarding speech for a cancelled read-aloud");
            return Ok(false);
        }
        self.pending_speech = None;
        self.release_read_aloud();

        self.read_aloud_generation += 1;
        let ended = EventSender::new(self.read_aloud_generation, self.events.clone());
        let output = self.backend.open_output(
            buffer.sample_rate,
            Box::new(move |id| {
                ended.send(SessionEvent::ReadAloudEnded(id));
            }),
        )?;
        let mut read_aloud = ReadAloud {
            output,
            scheduler: PlaybackScheduler::new(),
        };
        match read_aloud.scheduler.enqueue(read_aloud.output.as_mut(), buffer) {
            Ok(scheduled) => {
                debug!(start = scheduled.start, end = scheduled.end, "Read-aloud scheduled");
                self.read_aloud = Some(read_aloud);
                Ok(true)
            }
            Err(e) => {
                read_aloud.output.close();
                Err(e)
            }
        }
    }

    /// Record that speech generation for `request` failed. Returns false when
    /// the request was no longer current, so the failure need not be shown.
    pub fn read_aloud_failed(&mut self, request: u64) -> bool {
        if self.pending_speech == Some(request) {
            self.pending_speech = None;
            true
        } else {
            false
        }
    }

    /// Cancel any pending read-aloud request, stop playback and release its output.
    pub fn stop_read_aloud(&mut self) {
        self.pending_speech = None;
        self.release_read_aloud();
    }

    fn release_read_aloud(&mut self) {
        if let Some(mut read_aloud) = self.read_aloud.take() {
            read_aloud.scheduler.flush(read_aloud.output.as_mut());
            read_aloud.output.close();
            debug!("Read-aloud stopped");
        }
    }

    fn on_read_aloud_ended(&mut self, id: BufferId) {
        let finished = match self.read_aloud.as_mut() {
            Some(read_aloud) => {
                read_aloud.scheduler.on_ended(id);
                !read_aloud.scheduler.is_playing()
            }
            None => false,
        };
        if finished {
            self.release_read_aloud();
        }
    }

    fn event_sender(&self) -> EventSender {
        EventSender::new(self.generation, self.events.clone())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&VoiceError> {
        self.last_error.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn active_buffers(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn next_start_time(&self) -> f64 {
        self.scheduler.next_start_time()
    }

    /// Whether speech for a read-aloud request is still being generated.
    pub fn is_generating_speech(&self) -> bool {
        self.pending_speech.is_some()
    }

    pub fn is_read_aloud_playing(&self) -> bool {
        self.read_aloud
            .as_ref()
            .map_or(false, |read_aloud| read_aloud.scheduler.is_playing())
    }

    /// Snapshot for display.
    pub fn status(&self) -> VoiceStatus {
        let mut metrics = self.metrics.clone();
        if let Some(stats) = &self.resources.capture_stats {
            metrics.frames_sent = stats.frames_sent();
            metrics.frames_dropped = stats.frames_dropped();
        }

        let read_aloud_playing = self.is_read_aloud_playing();
        let playing = self.scheduler.is_playing() || read_aloud_playing;

        let mic = if matches!(self.last_error, Some(VoiceError::Permission(_))) {
            MicIndicator::AccessDenied
        } else if self.muted {
            MicIndicator::Muted
        } else {
            MicIndicator::Active
        };

        VoiceStatus {
            state: self.state,
            presence: Presence::derive(
                self.state,
                self.muted,
                playing,
                self.caption.text().is_some(),
                self.is_generating_speech(),
            ),
            mic,
            caption: self.caption.text().map(str::to_string),
            error: self.last_error.as_ref().map(|e| e.to_string()),
            read_aloud_playing,
            generating_speech: self.is_generating_speech(),
            metrics,
        }
    }
}
