use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tta_native_utils::audio::PcmBuffer;

use crate::error::{CaptureError, SessionError};
use crate::level::Analyser;

/// Identifies one scheduled playback buffer.
pub type SourceId = u64;

/// Called from the audio thread when a source played to its natural end.
pub type EndedCallback = Box<dyn Fn(SourceId) + Send + Sync>;

/// Keeps an open input stream alive; dropping or closing it releases the device.
pub trait StreamHandle: Send {
    fn close(&mut self);
}

/// A playback sink with its own clock, in seconds since it was opened.
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    fn current_time(&self) -> f64;

    /// Plays `buffer` starting at `start_at` on the output clock.
    fn schedule(&mut self, id: SourceId, buffer: PcmBuffer, start_at: f64) -> Result<()>;

    /// Silences a source immediately, whether or not it started.
    fn stop_source(&mut self, id: SourceId);

    fn close(&mut self);
}

/// Audio hardware as seen by the session.
pub trait AudioBackend: Send + Sync {
    /// Opens the microphone, delivering mono samples at `sample_rate` on `frames`.
    fn open_microphone(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn StreamHandle>, CaptureError>;

    /// Opens the speaker. Played samples are pushed into `analyser`.
    fn open_speaker(
        &self,
        sample_rate: u32,
        analyser: Arc<Analyser>,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn AudioOutput>, SessionError>;
}
