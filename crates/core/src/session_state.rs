use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tta_native_utils::audio::PLAYBACK_SAMPLE_RATE;

use crate::backend::{AudioBackend, SourceId};
use crate::capture::CapturePipeline;
use crate::error::{CaptureError, ErrorCategory, SessionError};
use crate::generic_types::{LiveEvent, LiveSetup};
use crate::imagegen::ImageGenerator;
use crate::level::{Analyser, LevelMeter, OUTPUT_FFT_SIZE};
use crate::mode::{AvatarMachine, AvatarMode, AvatarTrigger};
use crate::playback::{FinishOutcome, PlaybackPipeline};
use crate::realtime_api::{LiveChannel, LiveConnection, LiveConnector};
use crate::store::{AssistantStore, LogKind};
use crate::tools::{self, ToolDispatcher};

/// How often the raw level is sampled from the active analyser.
pub const LEVEL_TICK: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Everything that can wake the session up, tagged with the session it belongs to.
pub enum SessionEvent {
    Connected {
        session: u64,
        result: Result<LiveConnection, SessionError>,
    },
    Remote {
        session: u64,
        event: LiveEvent,
    },
    PlaybackEnded {
        session: u64,
        source: SourceId,
    },
}

impl SessionEvent {
    fn session(&self) -> u64 {
        match self {
            SessionEvent::Connected { session, .. }
            | SessionEvent::Remote { session, .. }
            | SessionEvent::PlaybackEnded { session, .. } => *session,
        }
    }
}

/// User-initiated controls accepted by [`VoiceSession::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// The start button: plays the intro when there is one, otherwise connects.
    Activate,
    IntroFinished,
    Start,
    Stop,
}

/// Resources owned by one live session, released together by `stop`.
struct SessionState {
    id: u64,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    channel: Option<Arc<dyn LiveChannel>>,
    tasks: Vec<JoinHandle<()>>,
    tracking: Arc<Mutex<bool>>,
}

/// Read-only handle for the presentation layer.
#[derive(Clone)]
pub struct SessionView {
    mode: watch::Receiver<AvatarMode>,
    level: LevelMeter,
    analyser: watch::Receiver<Option<Arc<Analyser>>>,
}

impl SessionView {
    pub fn mode(&self) -> AvatarMode {
        *self.mode.borrow()
    }

    pub fn mode_receiver(&self) -> watch::Receiver<AvatarMode> {
        self.mode.clone()
    }

    /// Raw level in [0, 1] of the authoritative stream.
    pub fn level(&self) -> f32 {
        self.level.get()
    }

    /// The analyser of the stream currently driving the level, if any.
    pub fn analyser(&self) -> Option<Arc<Analyser>> {
        self.analyser.borrow().clone()
    }
}

/// Sends [`SessionCommand`]s to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) {
        if self.commands.send(command).await.is_err() {
            tracing::debug!("session loop is gone, dropping {:?}", command);
        }
    }

    pub async fn activate(&self) {
        self.send(SessionCommand::Activate).await
    }

    pub async fn intro_finished(&self) {
        self.send(SessionCommand::IntroFinished).await
    }

    pub async fn start(&self) {
        self.send(SessionCommand::Start).await
    }

    pub async fn stop(&self) {
        self.send(SessionCommand::Stop).await
    }
}

/// The live voice session orchestrator.
///
/// Owns at most one [`SessionState`]. All inbound traffic (connect outcome,
/// remote messages, playback completions) is funnelled through one queue and
/// handled one event at a time.
pub struct VoiceSession {
    store: Arc<dyn AssistantStore>,
    connector: Arc<dyn LiveConnector>,
    backend: Arc<dyn AudioBackend>,
    tools: ToolDispatcher,
    has_intro: bool,

    machine: AvatarMachine,
    transport: TransportState,
    active: Option<SessionState>,
    generation: u64,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mode_tx: watch::Sender<AvatarMode>,
    analyser_tx: Arc<watch::Sender<Option<Arc<Analyser>>>>,
    level: LevelMeter,
}

impl VoiceSession {
    pub fn new(
        store: Arc<dyn AssistantStore>,
        connector: Arc<dyn LiveConnector>,
        backend: Arc<dyn AudioBackend>,
        images: Arc<dyn ImageGenerator>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mode_tx, _) = watch::channel(AvatarMode::Idle);
        let (analyser_tx, _) = watch::channel(None);
        Self {
            tools: ToolDispatcher::new(store.clone(), images),
            store,
            connector,
            backend,
            has_intro: false,
            machine: AvatarMachine::new(),
            transport: TransportState::Idle,
            active: None,
            generation: 0,
            events_tx,
            events_rx,
            mode_tx,
            analyser_tx: Arc::new(analyser_tx),
            level: LevelMeter::new(),
        }
    }

    /// Plays an intro before connecting when the user activates the assistant.
    pub fn with_intro(mut self, has_intro: bool) -> Self {
        self.has_intro = has_intro;
        self
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            mode: self.mode_tx.subscribe(),
            level: self.level.clone(),
            analyser: self.analyser_tx.subscribe(),
        }
    }

    pub fn mode(&self) -> AvatarMode {
        self.machine.mode()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport
    }

    /// Identity of the live session, if one exists.
    pub fn session_id(&self) -> Option<u64> {
        self.active.as_ref().map(|s| s.id)
    }

    pub fn pending_sources(&self) -> usize {
        self.active.as_ref().map_or(0, |s| s.playback.pending())
    }

    fn transition(&mut self, trigger: AvatarTrigger) {
        if let Some(mode) = self.machine.apply(trigger) {
            self.mode_tx.send_replace(mode);
        }
    }

    fn log_failure(&self, err: &SessionError) {
        tracing::error!("Voice session failure: {}", err);
        let message = match err.category() {
            ErrorCategory::PermissionDenied => {
                "Microphone refusé. Vérifiez les autorisations d'accès au microphone."
            }
            ErrorCategory::CapabilityUnsupported => {
                "API Live non supportée par cette clé. Utilisez une clé API payante."
            }
            _ => "Erreur critique de la session Live API.",
        };
        self.store.log_error(err.category(), message);
    }

    /// User pressed start.
    pub fn activate(&mut self) {
        if self.transport != TransportState::Idle || self.machine.mode() != AvatarMode::Idle {
            tracing::debug!("activate ignored in {:?}/{:?}", self.transport, self.mode());
            return;
        }
        self.transition(AvatarTrigger::UserStart {
            has_intro: self.has_intro,
        });
        if !self.has_intro {
            self.start();
        }
    }

    pub fn intro_finished(&mut self) {
        if self.machine.mode() != AvatarMode::Intro {
            return;
        }
        self.transition(AvatarTrigger::IntroEnded);
        self.start();
    }

    /// Allocates audio and opens the remote channel. A no-op while connecting or open.
    pub fn start(&mut self) {
        if matches!(
            self.transport,
            TransportState::Connecting | TransportState::Open
        ) {
            tracing::debug!("start ignored, session already {:?}", self.transport);
            return;
        }
        if self.store.config().is_maintenance_mode {
            tracing::warn!("Start refused: maintenance mode is active.");
            self.store.add_log(
                LogKind::Info,
                Some(ErrorCategory::MaintenanceBlocked),
                "Système bloqué : Mode Maintenance Manager actif.",
            );
            self.transition(AvatarTrigger::Stop);
            return;
        }

        self.transport = TransportState::Connecting;
        self.store.increment_sessions();
        self.generation += 1;
        let id = self.generation;
        tracing::info!("Starting voice session {}.", id);

        let output_analyser = Arc::new(Analyser::new(OUTPUT_FFT_SIZE));
        let on_ended = {
            let events = self.events_tx.clone();
            Box::new(move |source| {
                let _ = events.send(SessionEvent::PlaybackEnded {
                    session: id,
                    source,
                });
            })
        };
        let output =
            match self
                .backend
                .open_speaker(PLAYBACK_SAMPLE_RATE, output_analyser.clone(), on_ended)
            {
                Ok(output) => output,
                Err(err) => return self.abort_start(err),
            };
        let mut playback = PlaybackPipeline::new(output, output_analyser.clone());

        let capture = match CapturePipeline::acquire(self.backend.as_ref()) {
            Ok(capture) => capture,
            Err(err) => {
                playback.close();
                if let CaptureError::PermissionDenied(_) = &err {
                    tracing::warn!("Microphone access was refused.");
                }
                return self.abort_start(err.into());
            }
        };

        let tracking = Arc::new(Mutex::new(true));
        let level_task = spawn_level_tracker(
            self.mode_tx.subscribe(),
            capture.analyser(),
            output_analyser,
            self.level.clone(),
            self.analyser_tx.clone(),
            tracking.clone(),
        );

        let setup = LiveSetup {
            voice_name: self.store.config().selected_voice.as_str().to_string(),
            system_instruction: self.store.system_instruction(),
            tools: tools::declarations(),
        };
        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        let connect_task = tokio::spawn(async move {
            let result = connector.connect(setup).await;
            let _ = events.send(SessionEvent::Connected {
                session: id,
                result,
            });
        });

        self.active = Some(SessionState {
            id,
            capture,
            playback,
            channel: None,
            tasks: vec![level_task, connect_task],
            tracking,
        });
    }

    fn abort_start(&mut self, err: SessionError) {
        self.log_failure(&err);
        self.transport = TransportState::Idle;
        self.transition(AvatarTrigger::Stop);
    }

    /// Tears everything down. Idempotent and safe from any state.
    pub fn stop(&mut self) {
        self.machine.begin_stop();

        if let Some(mut state) = self.active.take() {
            tracing::info!("Stopping voice session {}.", state.id);
            *state.tracking.lock().unwrap_or_else(PoisonError::into_inner) = false;
            for task in state.tasks.drain(..) {
                task.abort();
            }
            state.capture.stop();
            state.playback.close();
            if let Some(channel) = state.channel.take() {
                close_best_effort(channel);
            }
        }

        self.transport = TransportState::Idle;
        self.level.set(0.0);
        self.analyser_tx.send_replace(None);
        self.transition(AvatarTrigger::Stop);
        self.machine.end_stop();
    }

    /// Waits for the next queued event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if self.session_id() != Some(event.session()) {
            tracing::debug!("dropping event from stale session {}", event.session());
            if let SessionEvent::Connected {
                result: Ok(conn), ..
            } = event
            {
                close_best_effort(conn.channel);
            }
            return;
        }

        match event {
            SessionEvent::Connected { result, .. } => self.on_connected(result),
            SessionEvent::Remote { event, .. } => self.on_remote(event).await,
            SessionEvent::PlaybackEnded { source, .. } => self.on_playback_ended(source),
        }
    }

    fn on_connected(&mut self, result: Result<LiveConnection, SessionError>) {
        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                self.log_failure(&err);
                return self.stop();
            }
        };
        let Some(state) = self.active.as_mut() else {
            return;
        };
        if self.transport != TransportState::Connecting {
            close_best_effort(conn.channel);
            return;
        }

        let session = state.id;
        state.capture.begin(conn.channel.clone());
        state.channel = Some(conn.channel);
        state
            .tasks
            .push(spawn_forwarder(session, conn.events, self.events_tx.clone()));

        self.transport = TransportState::Open;
        self.transition(AvatarTrigger::Opened);
        tracing::info!("Voice session {} is open.", session);
        self.store.log_info("Canal Live API Abdelmajid ouvert.");
    }

    async fn on_remote(&mut self, event: LiveEvent) {
        if self.transport != TransportState::Open {
            tracing::debug!("remote event before open: {:?}", event);
            return;
        }
        match event {
            LiveEvent::ModelTurn => self.store.increment_requests(),
            LiveEvent::Audio { data, mime_type } => self.on_audio(&data, &mime_type),
            LiveEvent::ToolCall(calls) => {
                self.transition(AvatarTrigger::ToolBatchStarted);
                let channel = self.active.as_ref().and_then(|s| s.channel.clone());
                for call in calls {
                    let result = self.tools.dispatch(&call).await;
                    let Some(channel) = &channel else {
                        continue;
                    };
                    if let Err(err) = channel.send_tool_response(&result).await {
                        tracing::warn!("Failed to answer tool call {}: {:#}", call.id, err);
                    }
                }
                self.transition(AvatarTrigger::ToolBatchFinished);
            }
            LiveEvent::Interrupted => {
                if let Some(state) = self.active.as_mut() {
                    state.playback.interrupt();
                }
                self.transition(AvatarTrigger::Interrupted);
            }
            LiveEvent::Transcript { speaker, text } => {
                self.store.set_transcription(speaker, &text);
            }
            LiveEvent::Grounding(chunks) => self.store.set_grounding_chunks(chunks),
            LiveEvent::TurnComplete => tracing::debug!("model turn complete"),
            LiveEvent::GoAway { time_left } => {
                tracing::warn!("Remote will close the session soon ({:?}).", time_left);
            }
            LiveEvent::Error(message) => {
                self.transport = TransportState::Closed;
                self.log_failure(&SessionError::from_remote(message));
                self.stop();
            }
            LiveEvent::Closed => {
                self.transport = TransportState::Closed;
                tracing::info!("Remote closed the live session.");
                self.store.log_info("Session terminée.");
                self.stop();
            }
        }
    }

    fn on_audio(&mut self, data: &str, mime_type: &str) {
        let Some(state) = self.active.as_mut() else {
            return;
        };
        match state.playback.enqueue_encoded(data, mime_type) {
            Ok(_) => self.transition(AvatarTrigger::AudioChunk),
            Err(err) => tracing::warn!("Dropping undecodable audio chunk: {:#}", err),
        }
    }

    fn on_playback_ended(&mut self, source: SourceId) {
        let Some(state) = self.active.as_mut() else {
            return;
        };
        if state.playback.source_ended(source) == FinishOutcome::Drained {
            self.transition(AvatarTrigger::PlaybackDrained);
        }
    }

    fn apply_command(&mut self, command: SessionCommand) {
        tracing::debug!("session command {:?}", command);
        match command {
            SessionCommand::Activate => self.activate(),
            SessionCommand::IntroFinished => self.intro_finished(),
            SessionCommand::Start => self.start(),
            SessionCommand::Stop => self.stop(),
        }
    }

    /// Spawns [`VoiceSession::run`] and returns the control handle.
    pub fn spawn(self) -> (SessionHandle, SessionView, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let view = self.view();
        let task = tokio::spawn(self.run(commands_rx));
        (
            SessionHandle {
                commands: commands_tx,
            },
            view,
            task,
        )
    }

    /// Processes commands and events until the command channel closes.
    ///
    /// A `Stop` arriving while an event is being handled (a slow tool batch,
    /// typically) cancels that handler.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.apply_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    let (cancelled, mut deferred) = {
                        let handling = self.handle_event(event);
                        tokio::pin!(handling);
                        let mut deferred = Vec::new();
                        let cancelled = loop {
                            tokio::select! {
                                _ = &mut handling => break false,
                                command = commands.recv() => match command {
                                    Some(SessionCommand::Stop) | None => break true,
                                    Some(other) => deferred.push(other),
                                },
                            }
                        };
                        (cancelled, deferred)
                    };
                    if cancelled {
                        // everything queued before the stop is superseded by it
                        tracing::info!(
                            "Event handling cancelled by stop, dropping {} queued commands.",
                            deferred.len()
                        );
                        deferred.clear();
                        self.stop();
                    }
                    for command in deferred {
                        self.apply_command(command);
                    }
                }
            }
        }
        self.stop();
        tracing::info!("Voice session loop finished.");
    }
}

fn close_best_effort(channel: Arc<dyn LiveChannel>) {
    tokio::spawn(async move {
        if let Err(err) = channel.close().await {
            tracing::debug!("ignoring close error: {:#}", err);
        }
    });
}

/// Pumps remote events into the session queue. A stream that ends without a
/// terminal event is reported as closed.
fn spawn_forwarder(
    session: u64,
    mut events: mpsc::Receiver<LiveEvent>,
    queue: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let terminal = matches!(event, LiveEvent::Closed | LiveEvent::Error(_));
            if queue.send(SessionEvent::Remote { session, event }).is_err() || terminal {
                return;
            }
        }
        let _ = queue.send(SessionEvent::Remote {
            session,
            event: LiveEvent::Closed,
        });
    })
}

/// Samples the capture analyser while listening and the playback analyser while talking.
fn spawn_level_tracker(
    mode: watch::Receiver<AvatarMode>,
    input: Arc<Analyser>,
    output: Arc<Analyser>,
    level: LevelMeter,
    active: Arc<watch::Sender<Option<Arc<Analyser>>>>,
    tracking: Arc<Mutex<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LEVEL_TICK);
        loop {
            ticker.tick().await;
            let analyser = if *mode.borrow() == AvatarMode::Talking {
                &output
            } else {
                &input
            };

            let live = tracking.lock().unwrap_or_else(PoisonError::into_inner);
            if !*live {
                return;
            }
            level.set(analyser.level());
            active.send_if_modified(|current| match current {
                Some(current) if Arc::ptr_eq(current, analyser) => false,
                _ => {
                    *current = Some(analyser.clone());
                    true
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic_types::{Speaker, ToolCall};
    use crate::imagegen::{GeneratedImagePayload, MockImageGenerator};
    use crate::store::InMemoryStore;
    use crate::test_support::{FakeBackend, FakeConnector, RecordingChannel, Sent};
    use async_trait::async_trait;
    use serde_json::json;
    use tta_native_utils::audio::{ToBinary, encode};

    struct Harness {
        session: VoiceSession,
        store: Arc<InMemoryStore>,
        backend: Arc<FakeBackend>,
        connector: Arc<FakeConnector>,
        channel: Arc<RecordingChannel>,
        sent: mpsc::UnboundedReceiver<Sent>,
        remote: mpsc::Sender<LiveEvent>,
    }

    fn harness_with(backend: FakeBackend, images: Arc<dyn ImageGenerator>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(backend);
        let (channel, sent) = RecordingChannel::new();
        let (connector, remote) = FakeConnector::new(channel.clone());
        let session = VoiceSession::new(
            store.clone(),
            connector.clone(),
            backend.clone(),
            images,
        );
        Harness {
            session,
            store,
            backend,
            connector,
            channel,
            sent,
            remote,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeBackend::new(), Arc::new(MockImageGenerator::new()))
    }

    fn audio_chunk(samples: usize) -> LiveEvent {
        LiveEvent::Audio {
            data: encode(&vec![100i16; samples].to_binary()),
            mime_type: "audio/pcm;rate=24000".to_string(),
        }
    }

    impl Harness {
        async fn step(&mut self) {
            let event = tokio::time::timeout(Duration::from_secs(1), self.session.next_event())
                .await
                .expect("no session event")
                .expect("event queue closed");
            self.session.handle_event(event).await;
        }

        async fn open(&mut self) {
            self.session.activate();
            self.step().await;
            assert_eq!(self.session.transport_state(), TransportState::Open);
        }

        async fn remote(&mut self, event: LiveEvent) {
            self.remote.send(event).await.unwrap();
            self.step().await;
        }

        async fn wait_for_close(&mut self) {
            loop {
                let sent = tokio::time::timeout(Duration::from_secs(1), self.sent.recv())
                    .await
                    .expect("channel was never closed")
                    .unwrap();
                if sent == Sent::Close {
                    return;
                }
            }
        }

        fn last_log(&self) -> crate::store::LogEntry {
            self.store.logs().pop().unwrap()
        }
    }

    #[tokio::test]
    async fn test_mode_sequence_without_intro() {
        let mut h = harness();
        let view = h.session.view();

        h.session.activate();
        assert_eq!(h.session.mode(), AvatarMode::Connecting);
        assert_eq!(h.session.transport_state(), TransportState::Connecting);

        h.step().await;
        assert_eq!(h.session.transport_state(), TransportState::Open);
        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.last_log().message, "Canal Live API Abdelmajid ouvert.");
        assert_eq!(h.store.usage().total_sessions, 1);

        let setup = h.connector.setups.lock().unwrap()[0].clone();
        assert_eq!(setup.voice_name, "Fenrir");
        assert_eq!(setup.tools.len(), 4);

        h.remote(audio_chunk(2400)).await;
        assert_eq!(h.session.mode(), AvatarMode::Talking);
        assert_eq!(view.mode(), AvatarMode::Talking);
        assert_eq!(h.session.pending_sources(), 1);

        h.backend.end_source(0);
        h.step().await;
        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.pending_sources(), 0);
    }

    #[tokio::test]
    async fn test_intro_delays_connect() {
        let store = Arc::new(InMemoryStore::new());
        let (channel, _sent) = RecordingChannel::new();
        let (connector, _remote) = FakeConnector::new(channel);
        let mut session = VoiceSession::new(
            store,
            connector.clone(),
            Arc::new(FakeBackend::new()),
            Arc::new(MockImageGenerator::new()),
        )
        .with_intro(true);

        session.activate();
        assert_eq!(session.mode(), AvatarMode::Intro);
        assert_eq!(session.transport_state(), TransportState::Idle);

        session.intro_finished();
        assert_eq!(session.mode(), AvatarMode::Idle);
        assert_eq!(session.transport_state(), TransportState::Connecting);

        let event = session.next_event().await.unwrap();
        session.handle_event(event).await;
        assert_eq!(session.transport_state(), TransportState::Open);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_start_while_connecting_is_noop() {
        let mut h = harness();
        h.session.activate();
        let id = h.session.session_id();
        assert_eq!(id, Some(1));

        h.session.start();
        h.session.activate();
        assert_eq!(h.session.session_id(), id);

        h.step().await;
        h.session.start();
        assert_eq!(h.session.session_id(), id);
        assert_eq!(h.connector.connect_count(), 1);
        assert_eq!(h.store.usage().total_sessions, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness();
        h.open().await;
        h.remote(audio_chunk(480)).await;

        h.session.stop();
        h.session.stop();

        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert_eq!(h.session.session_id(), None);
        assert_eq!(h.session.view().level(), 0.0);
        assert!(h.session.view().analyser().is_none());
        assert!(h.backend.microphone_closed());
        h.backend.output_state(|out| {
            assert_eq!(out.closed, 1);
            assert_eq!(out.stopped, vec![0]);
        });

        h.wait_for_close().await;
        tokio::task::yield_now().await;
        assert_eq!(h.channel.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_mid_connect() {
        let mut h = harness();
        let gate = h.connector.hold_open();
        h.session.activate();
        tokio::task::yield_now().await;

        h.session.stop();
        drop(gate);
        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert!(h.backend.microphone_closed());

        // a late connect result belongs to a dead session
        let (late_channel, mut late_sent) = RecordingChannel::new();
        let (_, events) = mpsc::channel(1);
        h.session
            .handle_event(SessionEvent::Connected {
                session: 1,
                result: Ok(LiveConnection {
                    channel: late_channel,
                    events,
                }),
            })
            .await;
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert_eq!(late_sent.recv().await, Some(Sent::Close));
    }

    #[tokio::test]
    async fn test_interruption_clears_playback() {
        let mut h = harness();
        h.open().await;
        h.backend.output.lock().unwrap().now = 1.0;
        h.remote(audio_chunk(12_000)).await;
        h.remote(audio_chunk(12_000)).await;
        assert_eq!(h.session.pending_sources(), 2);
        h.backend
            .output_state(|out| assert_eq!(out.scheduled, vec![(0, 1.0), (1, 1.5)]));

        h.remote(LiveEvent::Interrupted).await;
        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.pending_sources(), 0);
        h.backend.output_state(|out| assert_eq!(out.stopped, vec![0, 1]));

        // completions for stopped sources change nothing
        h.backend.end_source(0);
        h.step().await;
        assert_eq!(h.session.mode(), AvatarMode::Idle);

        // the clock restarts from the output time, not from the stale end
        h.backend.output.lock().unwrap().now = 1.25;
        h.remote(audio_chunk(240)).await;
        assert_eq!(h.session.mode(), AvatarMode::Talking);
        h.backend
            .output_state(|out| assert_eq!(out.scheduled.last(), Some(&(2, 1.25))));
    }

    #[tokio::test]
    async fn test_tool_batch_answers_each_call_in_order() {
        let mut h = harness();
        h.open().await;

        let calls = vec![
            ToolCall {
                id: "a".into(),
                name: "checkInventory".into(),
                args: json!({ "productName": "cimbali" }),
            },
            ToolCall {
                id: "b".into(),
                name: "manageTodoList".into(),
                args: json!({ "action": "add", "taskText": "Rappeler Sami" }),
            },
            ToolCall {
                id: "c".into(),
                name: "doesNotExist".into(),
                args: json!({}),
            },
        ];
        h.remote(LiveEvent::ToolCall(calls)).await;

        let responses = h.channel.tool_responses();
        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(responses[0].result_text.contains('5'));
        assert_eq!(h.store.todos().len(), 1);
        assert_eq!(h.session.mode(), AvatarMode::Idle);
    }

    #[tokio::test]
    async fn test_transcripts_and_grounding_are_forwarded() {
        let mut h = harness();
        h.open().await;
        h.remote(LiveEvent::ModelTurn).await;
        h.remote(LiveEvent::Transcript {
            speaker: Speaker::User,
            text: "Bonjour, vous avez la M26 ?".into(),
        })
        .await;
        h.remote(LiveEvent::Grounding(vec![crate::generic_types::GroundingChunk {
            uri: Some("https://tta.tn".into()),
            title: Some("T.T.A".into()),
        }]))
        .await;

        assert_eq!(
            h.store.transcription(Speaker::User).as_deref(),
            Some("Bonjour, vous avez la M26 ?")
        );
        assert_eq!(h.store.grounding_chunks().len(), 1);
        assert_eq!(h.store.usage().requests_today, 1);
    }

    #[tokio::test]
    async fn test_maintenance_blocks_start() {
        let mut h = harness();
        h.store.set_maintenance_mode(true);
        h.session.activate();

        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert_eq!(h.connector.connect_count(), 0);
        let log = h.last_log();
        assert_eq!(log.message, "Système bloqué : Mode Maintenance Manager actif.");
        assert_eq!(log.kind, LogKind::Info);
        assert_eq!(log.category, Some(ErrorCategory::MaintenanceBlocked));
        assert_eq!(h.store.usage().total_sessions, 0);
    }

    #[tokio::test]
    async fn test_permission_denied_aborts_start() {
        let mut h = harness_with(
            FakeBackend::denying_microphone(),
            Arc::new(MockImageGenerator::new()),
        );
        h.session.activate();

        assert_eq!(h.session.mode(), AvatarMode::Idle);
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert_eq!(h.session.session_id(), None);
        let log = h.last_log();
        assert_eq!(log.kind, LogKind::Error);
        assert_eq!(log.category, Some(ErrorCategory::PermissionDenied));
        h.backend.output_state(|out| assert_eq!(out.closed, 1));
        tokio::task::yield_now().await;
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_categorized_and_fatal() {
        let mut h = harness();
        h.open().await;
        h.remote(LiveEvent::Error(
            "Live API is not enabled for this API key".into(),
        ))
        .await;

        let log = h.last_log();
        assert_eq!(log.category, Some(ErrorCategory::CapabilityUnsupported));
        assert_eq!(
            log.message,
            "API Live non supportée par cette clé. Utilisez une clé API payante."
        );
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert_eq!(h.session.session_id(), None);
        h.wait_for_close().await;
    }

    #[tokio::test]
    async fn test_remote_close_tears_down() {
        let mut h = harness();
        h.open().await;
        h.remote(LiveEvent::Closed).await;
        assert_eq!(h.last_log().message, "Session terminée.");
        assert_eq!(h.session.transport_state(), TransportState::Idle);
        assert!(h.backend.microphone_closed());
    }

    #[tokio::test]
    async fn test_close_errors_are_swallowed() {
        let store = Arc::new(InMemoryStore::new());
        let (channel, mut sent) = RecordingChannel::failing_close();
        let (connector, _remote) = FakeConnector::new(channel);
        let mut session = VoiceSession::new(
            store,
            connector,
            Arc::new(FakeBackend::new()),
            Arc::new(MockImageGenerator::new()),
        );
        session.activate();
        let event = session.next_event().await.unwrap();
        session.handle_event(event).await;
        session.stop();
        assert_eq!(sent.recv().await, Some(Sent::Close));
        assert_eq!(session.mode(), AvatarMode::Idle);
    }

    #[tokio::test]
    async fn test_connect_failure_resets() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let mut session = VoiceSession::new(
            store.clone(),
            FakeConnector::failing("BidiGenerateContent is not supported for this model"),
            backend.clone(),
            Arc::new(MockImageGenerator::new()),
        );
        session.activate();
        let event = session.next_event().await.unwrap();
        session.handle_event(event).await;

        assert_eq!(session.mode(), AvatarMode::Idle);
        assert_eq!(session.transport_state(), TransportState::Idle);
        assert!(backend.microphone_closed());
        assert_eq!(
            store.logs().pop().unwrap().category,
            Some(ErrorCategory::CapabilityUnsupported)
        );
    }

    struct StalledImages;

    #[async_trait]
    impl ImageGenerator for StalledImages {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<Option<GeneratedImagePayload>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stop_preempts_slow_tool_batch() {
        let h = harness_with(FakeBackend::new(), Arc::new(StalledImages));
        let Harness {
            session,
            channel,
            remote,
            mut sent,
            ..
        } = h;
        let (handle, view, task) = session.spawn();
        let mut mode = view.mode_receiver();

        handle.activate().await;
        // queued remotely, delivered once the channel is open
        remote
            .send(LiveEvent::ToolCall(vec![ToolCall {
                id: "slow".into(),
                name: "generateMarketingPoster".into(),
                args: json!({ "prompt": "Astoria Storm" }),
            }]))
            .await
            .unwrap();
        mode.wait_for(|m| *m == AvatarMode::Thinking).await.unwrap();

        handle.stop().await;
        mode.wait_for(|m| *m == AvatarMode::Idle).await.unwrap();
        loop {
            if sent.recv().await == Some(Sent::Close) {
                break;
            }
        }
        assert!(channel.tool_responses().is_empty());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_queued_before_stop_does_not_reconnect() {
        let h = harness_with(FakeBackend::new(), Arc::new(StalledImages));
        let Harness {
            session,
            connector,
            remote,
            mut sent,
            ..
        } = h;
        let (handle, view, task) = session.spawn();
        let mut mode = view.mode_receiver();

        handle.activate().await;
        remote
            .send(LiveEvent::ToolCall(vec![ToolCall {
                id: "slow".into(),
                name: "generateMarketingPoster".into(),
                args: json!({ "prompt": "Cimbali M23" }),
            }]))
            .await
            .unwrap();
        mode.wait_for(|m| *m == AvatarMode::Thinking).await.unwrap();

        handle.start().await;
        handle.stop().await;
        loop {
            if sent.recv().await == Some(Sent::Close) {
                break;
            }
        }
        drop(handle);
        task.await.unwrap();

        // a restarted session would connect from a spawned task
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(view.mode(), AvatarMode::Idle);
    }
}
