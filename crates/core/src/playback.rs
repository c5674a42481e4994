use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tta_native_utils::audio::{PLAYBACK_SAMPLE_RATE, PcmBuffer, decode, decode_to_buffer, parse_pcm_rate};

use crate::backend::{AudioOutput, SourceId};
use crate::level::Analyser;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub end: f64,
}

/// Result of a natural end notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// That was the last tracked source.
    Drained,
    StillPlaying,
    /// The source was already removed, e.g. by an interruption.
    Unknown,
}

/// Gapless back-to-back scheduling over an output clock.
///
/// `next_start_time` never decreases except on [`PlaybackScheduler::interrupt`],
/// which resets it to zero.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    sources: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn pending(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn schedule(&mut self, now: f64, duration: f64) -> ScheduledSource {
        let start = self.next_start_time.max(now);
        self.next_start_time = start + duration;
        let source = ScheduledSource {
            id: self.next_id,
            start,
            end: self.next_start_time,
        };
        self.next_id += 1;
        self.sources.insert(source.id, source);
        source
    }

    pub fn finish(&mut self, id: SourceId) -> FinishOutcome {
        if self.sources.remove(&id).is_none() {
            return FinishOutcome::Unknown;
        }
        if self.sources.is_empty() {
            FinishOutcome::Drained
        } else {
            FinishOutcome::StillPlaying
        }
    }

    /// Forgets every source and rewinds the clock. Returns the ids to silence.
    pub fn interrupt(&mut self) -> Vec<SourceId> {
        self.next_start_time = 0.0;
        std::mem::take(&mut self.sources).into_keys().collect()
    }
}

/// Decodes inbound audio and plays it through an [`AudioOutput`].
pub struct PlaybackPipeline {
    output: Box<dyn AudioOutput>,
    scheduler: PlaybackScheduler,
    analyser: Arc<Analyser>,
}

impl PlaybackPipeline {
    pub fn new(output: Box<dyn AudioOutput>, analyser: Arc<Analyser>) -> Self {
        Self {
            output,
            scheduler: PlaybackScheduler::new(),
            analyser,
        }
    }

    pub fn analyser(&self) -> Arc<Analyser> {
        self.analyser.clone()
    }

    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn next_start_time(&self) -> f64 {
        self.scheduler.next_start_time()
    }

    pub fn enqueue(&mut self, buffer: PcmBuffer) -> Result<ScheduledSource> {
        let now = self.output.current_time();
        let source = self.scheduler.schedule(now, buffer.duration());
        if let Err(err) = self.output.schedule(source.id, buffer, source.start) {
            self.scheduler.finish(source.id);
            return Err(err);
        }
        tracing::trace!(
            "scheduled source {} at {:.3}s..{:.3}s",
            source.id,
            source.start,
            source.end
        );
        Ok(source)
    }

    /// Decodes a base64 PCM16 chunk, taking the rate from its mime type.
    pub fn enqueue_encoded(&mut self, data: &str, mime_type: &str) -> Result<ScheduledSource> {
        let bytes = decode(data).context("audio chunk is not valid base64")?;
        let rate = parse_pcm_rate(mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
        self.enqueue(decode_to_buffer(&bytes, rate, 1))
    }

    pub fn source_ended(&mut self, id: SourceId) -> FinishOutcome {
        self.scheduler.finish(id)
    }

    /// Hard stop for barge-in.
    pub fn interrupt(&mut self) {
        let ids = self.scheduler.interrupt();
        tracing::debug!("interrupting {} scheduled sources", ids.len());
        for id in ids {
            self.output.stop_source(id);
        }
        self.analyser.reset();
    }

    pub fn close(&mut self) {
        self.interrupt();
        self.output.close();
    }
}
