use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tta_native_utils::audio::{CAPTURE_MIME_TYPE, CAPTURE_SAMPLE_RATE, encode_f32};

use crate::backend::{AudioBackend, StreamHandle};
use crate::error::CaptureError;
use crate::generic_types::AudioFrame;
use crate::level::{Analyser, INPUT_FFT_SIZE};
use crate::realtime_api::LiveChannel;

/// Samples per frame sent to the remote service.
pub const FRAME_SIZE: usize = 4096;

/// Bounded queue between the audio thread and the pump.
const CAPTURE_QUEUE: usize = 64;

/// Regroups arbitrary-sized sample blocks into fixed frames.
#[derive(Debug)]
pub struct FrameChunker {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Buffers `samples` and returns every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_size * self.frame_size;
        self.pending
            .drain(..complete)
            .collect::<Vec<_>>()
            .chunks(self.frame_size)
            .map(<[f32]>::to_vec)
            .collect()
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// PCM16 (saturated) + base64, tagged with the capture mime type.
pub fn encode_frame(frame: &[f32]) -> AudioFrame {
    AudioFrame {
        mime_type: CAPTURE_MIME_TYPE.to_string(),
        data: encode_f32(frame),
    }
}

/// Owns the microphone for one session.
///
/// Samples always feed the input analyser; frames are only sent once a live
/// channel has been attached with [`CapturePipeline::begin`].
pub struct CapturePipeline {
    stream: Option<Box<dyn StreamHandle>>,
    link: watch::Sender<Option<Arc<dyn LiveChannel>>>,
    analyser: Arc<Analyser>,
    pump: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Opens the microphone at 16 kHz mono. Refused access surfaces as
    /// [`CaptureError::PermissionDenied`].
    pub fn acquire(backend: &dyn AudioBackend) -> Result<Self, CaptureError> {
        let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_QUEUE);
        let stream = backend.open_microphone(CAPTURE_SAMPLE_RATE, frames_tx)?;
        let analyser = Arc::new(Analyser::new(INPUT_FFT_SIZE));
        let (link, link_rx) = watch::channel(None);
        let pump = tokio::spawn(pump_frames(frames_rx, link_rx, analyser.clone()));
        tracing::info!("Microphone acquired at {} Hz.", CAPTURE_SAMPLE_RATE);

        Ok(Self {
            stream: Some(stream),
            link,
            analyser,
            pump: Some(pump),
        })
    }

    /// Starts forwarding frames to `channel`.
    pub fn begin(&self, channel: Arc<dyn LiveChannel>) {
        self.link.send_replace(Some(channel));
    }

    pub fn analyser(&self) -> Arc<Analyser> {
        self.analyser.clone()
    }

    /// Releases the microphone. Safe to call more than once.
    pub fn stop(&mut self) {
        self.link.send_replace(None);
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            tracing::debug!("microphone released");
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.analyser.reset();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_frames(
    mut samples_rx: mpsc::Receiver<Vec<f32>>,
    link: watch::Receiver<Option<Arc<dyn LiveChannel>>>,
    analyser: Arc<Analyser>,
) {
    let mut chunker = FrameChunker::new(FRAME_SIZE);
    while let Some(samples) = samples_rx.recv().await {
        analyser.push(&samples);

        let channel = link.borrow().clone();
        let Some(channel) = channel else {
            chunker.clear();
            continue;
        };

        for frame in chunker.push(&samples) {
            if let Err(err) = channel.send_realtime_audio(encode_frame(&frame)).await {
                tracing::debug!("dropping capture frame: {:#}", err);
            }
        }
    }
    tracing::debug!("capture stream ended");
}
