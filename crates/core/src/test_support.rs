//! Hand-written fakes shared by the session and pipeline tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tta_native_utils::audio::PcmBuffer;

use crate::backend::{AudioBackend, AudioOutput, EndedCallback, SourceId, StreamHandle};
use crate::error::{CaptureError, SessionError};
use crate::generic_types::{AudioFrame, LiveEvent, LiveSetup, ToolResult};
use crate::level::Analyser;
use crate::realtime_api::{LiveChannel, LiveConnection, LiveConnector};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Audio(AudioFrame),
    ToolResponse(ToolResult),
    Close,
}

/// Records everything sent and mirrors it on an unbounded channel.
pub struct RecordingChannel {
    sent: Mutex<Vec<Sent>>,
    notify: mpsc::UnboundedSender<Sent>,
    fail_close: bool,
}

impl RecordingChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
        Self::build(false)
    }

    pub fn failing_close() -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
        Self::build(true)
    }

    fn build(fail_close: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Sent>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            notify,
            fail_close,
        });
        (channel, rx)
    }

    fn record(&self, item: Sent) {
        self.sent.lock().unwrap().push(item.clone());
        let _ = self.notify.send(item);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn audio_frames(&self) -> usize {
        self.sent()
            .iter()
            .filter(|s| matches!(s, Sent::Audio(_)))
            .count()
    }

    pub fn tool_responses(&self) -> Vec<ToolResult> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::ToolResponse(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.sent().iter().filter(|s| **s == Sent::Close).count()
    }
}

#[async_trait]
impl LiveChannel for RecordingChannel {
    async fn send_realtime_audio(&self, frame: AudioFrame) -> Result<()> {
        self.record(Sent::Audio(frame));
        Ok(())
    }

    async fn send_tool_response(&self, result: &ToolResult) -> Result<()> {
        self.record(Sent::ToolResponse(result.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Sent::Close);
        if self.fail_close {
            anyhow::bail!("socket already gone");
        }
        Ok(())
    }
}

/// Hands out one prepared connection per `connect`, or a scripted failure.
pub struct FakeConnector {
    channel: Arc<RecordingChannel>,
    events: Mutex<Option<mpsc::Receiver<LiveEvent>>>,
    failure: Option<String>,
    gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    pub setups: Mutex<Vec<LiveSetup>>,
}

impl FakeConnector {
    /// Returns the connector plus the sender that plays the remote side.
    pub fn new(channel: Arc<RecordingChannel>) -> (Arc<Self>, mpsc::Sender<LiveEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let connector = Arc::new(Self {
            channel,
            events: Mutex::new(Some(rx)),
            failure: None,
            gate: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
        });
        (connector, tx)
    }

    pub fn failing(message: &str) -> Arc<Self> {
        let (channel, _) = RecordingChannel::new();
        let (_, rx) = mpsc::channel(1);
        Arc::new(Self {
            channel,
            events: Mutex::new(Some(rx)),
            failure: Some(message.to_string()),
            gate: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
        })
    }

    /// Holds `connect` open until the returned sender fires or is dropped.
    pub fn hold_open(&self) -> tokio::sync::oneshot::Sender<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn connect_count(&self) -> usize {
        self.setups.lock().unwrap().len()
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, setup: LiveSetup) -> Result<LiveConnection, SessionError> {
        self.setups.lock().unwrap().push(setup);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(message) = &self.failure {
            return Err(SessionError::from_remote(message.clone()));
        }
        let events = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::TransportFailure("already connected".into()))?;
        Ok(LiveConnection {
            channel: self.channel.clone(),
            events,
        })
    }
}

#[derive(Debug, Default)]
pub struct OutputState {
    pub now: f64,
    pub scheduled: Vec<(SourceId, f64)>,
    pub stopped: Vec<SourceId>,
    pub closed: usize,
}

struct FakeOutput(Arc<Mutex<OutputState>>);

impl AudioOutput for FakeOutput {
    fn sample_rate(&self) -> u32 {
        24_000
    }

    fn current_time(&self) -> f64 {
        self.0.lock().unwrap().now
    }

    fn schedule(&mut self, id: SourceId, _buffer: PcmBuffer, start_at: f64) -> Result<()> {
        self.0.lock().unwrap().scheduled.push((id, start_at));
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.0.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed += 1;
    }
}

struct FakeStream(Arc<AtomicBool>);

impl StreamHandle for FakeStream {
    fn close(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Audio backend without hardware; tests drive the microphone and end sources by hand.
pub struct FakeBackend {
    deny_microphone: bool,
    microphone: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    microphone_closed: Arc<AtomicBool>,
    pub output: Arc<Mutex<OutputState>>,
    on_ended: Mutex<Option<EndedCallback>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            deny_microphone: false,
            microphone: Mutex::new(None),
            microphone_closed: Arc::new(AtomicBool::new(false)),
            output: Arc::new(Mutex::new(OutputState::default())),
            on_ended: Mutex::new(None),
        }
    }

    pub fn denying_microphone() -> Self {
        Self {
            deny_microphone: true,
            ..Self::new()
        }
    }

    pub fn microphone(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        self.microphone.lock().unwrap().clone()
    }

    pub fn microphone_closed(&self) -> bool {
        self.microphone_closed.load(Ordering::SeqCst)
    }

    /// Simulates the natural end of a scheduled source.
    pub fn end_source(&self, id: SourceId) {
        if let Some(on_ended) = self.on_ended.lock().unwrap().as_ref() {
            on_ended(id);
        }
    }

    pub fn output_state<R>(&self, f: impl FnOnce(&OutputState) -> R) -> R {
        f(&self.output.lock().unwrap())
    }
}

impl AudioBackend for FakeBackend {
    fn open_microphone(
        &self,
        _sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn StreamHandle>, CaptureError> {
        if self.deny_microphone {
            return Err(CaptureError::from_backend("NotAllowedError: Permission denied"));
        }
        *self.microphone.lock().unwrap() = Some(frames);
        self.microphone_closed.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeStream(self.microphone_closed.clone())))
    }

    fn open_speaker(
        &self,
        _sample_rate: u32,
        _analyser: Arc<Analyser>,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn AudioOutput>, SessionError> {
        *self.on_ended.lock().unwrap() = Some(on_ended);
        Ok(Box::new(FakeOutput(self.output.clone())))
    }
}
