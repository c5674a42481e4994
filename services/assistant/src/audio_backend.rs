use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use rubato::{FastFixedIn, Resampler};
use tokio::sync::mpsc;
use tta_core::backend::{AudioBackend, AudioOutput, EndedCallback, SourceId, StreamHandle};
use tta_core::error::{CaptureError, SessionError};
use tta_core::level::Analyser;
use tta_native_utils::audio::{PcmBuffer, create_resampler};
use tta_native_utils::device::{get_or_default_input, get_or_default_output};

use crate::config::{INPUT_CHUNK_SIZE, OUTPUT_CHUNK_SIZE};

/// cpal streams are not `Send`, so each one lives on its own thread until stopped.
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `build` on a dedicated thread and keeps its result alive until stopped.
    ///
    /// The outer error covers thread creation, the inner one whatever `build` returned.
    fn spawn<S, E, F>(name: &str, build: F) -> std::io::Result<Result<Self, E>>
    where
        S: 'static,
        E: Send + 'static,
        F: FnOnce() -> Result<S, E> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), E>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // returns on stop or when the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Ok(Self {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(err)) => {
                let _ = thread.join();
                Ok(Err(err))
            }
            Err(_) => {
                let _ = thread.join();
                Err(std::io::Error::other("audio thread exited during setup"))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::debug!("audio thread panicked during shutdown");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StreamHandle for StreamThread {
    fn close(&mut self) {
        self.stop();
    }
}

/// Audio hardware through cpal, resampling between device rates and the session rates.
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        data.to_vec()
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError> {
    let input = get_or_default_input(device_name)
        .map_err(|e| CaptureError::NoDevice(format!("{e:#}")))?;
    tracing::info!("Using input device: {:?}", input.name().unwrap_or_default());

    let default_config = input
        .default_input_config()
        .map_err(|e| CaptureError::from_backend(e.to_string()))?;
    let input_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
    };
    let channel_count = input_config.channels as usize;
    let device_rate = input_config.sample_rate.0;
    tracing::info!("Input stream config: {:?}", &input_config);

    let mut resampler = if device_rate == sample_rate {
        None
    } else {
        Some(
            create_resampler(device_rate as f64, sample_rate as f64, INPUT_CHUNK_SIZE)
                .map_err(|e| CaptureError::Stream(format!("{e:#}")))?,
        )
    };
    let mut pending: Vec<f32> = Vec::with_capacity(INPUT_CHUNK_SIZE * 2);

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        pending.extend(downmix(data, channel_count));
        let mut out = Vec::new();
        while pending.len() >= INPUT_CHUNK_SIZE {
            let block: Vec<f32> = pending.drain(..INPUT_CHUNK_SIZE).collect();
            match resampler.as_mut() {
                Some(r) => match r.process(&[block.as_slice()], None) {
                    Ok(resampled) => {
                        if let Some(first) = resampled.first() {
                            out.extend_from_slice(first);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to resample input: {}", e),
                },
                None => out.extend(block),
            }
        }
        if !out.is_empty() {
            if let Err(e) = frames.try_send(out) {
                tracing::warn!("Failed to send audio data to buffer: {:?}", e);
            }
        }
    };

    let stream = input
        .build_input_stream(
            &input_config,
            input_data_fn,
            move |err| tracing::error!("An error occurred on input stream: {}", err),
            None,
        )
        .map_err(|e| CaptureError::from_backend(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::from_backend(e.to_string()))?;
    Ok(stream)
}

/// A run of samples at the device rate, tagged with the source that produced it.
struct Segment {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Segment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sums segments onto the device timeline and reports sources whose scheduled
/// end has been played.
struct Mixer {
    device_rate: u32,
    frames_played: u64,
    segments: Vec<Segment>,
    /// Scheduled end frame of every live source.
    sources: Vec<(SourceId, u64)>,
}

impl Mixer {
    fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            frames_played: 0,
            segments: Vec::new(),
            sources: Vec::new(),
        }
    }

    fn current_time(&self) -> f64 {
        self.frames_played as f64 / self.device_rate as f64
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds * self.device_rate as f64).round().max(0.0) as u64
    }

    fn track(&mut self, id: SourceId, end_frame: u64) {
        self.sources.push((id, end_frame));
    }

    fn add(&mut self, id: SourceId, start_frame: u64, samples: Vec<f32>) {
        if !samples.is_empty() {
            self.segments.push(Segment {
                id,
                start_frame,
                samples,
            });
        }
    }

    fn remove(&mut self, id: SourceId) {
        self.segments.retain(|s| s.id != id);
        self.sources.retain(|(source, _)| *source != id);
    }

    fn clear(&mut self) {
        self.segments.clear();
        self.sources.clear();
    }

    /// Fills `mono` with the next block and returns the sources that finished in it.
    fn render(&mut self, mono: &mut [f32]) -> Vec<SourceId> {
        let block_start = self.frames_played;
        let block_end = block_start + mono.len() as u64;
        mono.iter_mut().for_each(|s| *s = 0.0);

        for segment in &self.segments {
            let from = segment.start_frame.max(block_start);
            let to = segment.end_frame().min(block_end);
            for frame in from..to {
                mono[(frame - block_start) as usize] +=
                    segment.samples[(frame - segment.start_frame) as usize];
            }
        }
        self.frames_played = block_end;
        self.segments.retain(|s| s.end_frame() > block_end);

        let mut ended = Vec::new();
        self.sources.retain(|&(id, end)| {
            let done = end <= block_end;
            if done {
                ended.push(id);
            }
            !done
        });
        ended
    }
}

/// Input frames per resampler block on the playback side.
const OUTPUT_RESAMPLE_CHUNK: usize = 240;

/// Converts back-to-back chunks as one continuous stream.
///
/// The resampler keeps its filter state across contiguous chunks and output is
/// written at a running cursor, so chunk boundaries add neither gaps nor
/// transients. A chunk that does not start where the previous one ended
/// restarts the stream at its own start frame.
struct StreamResampler {
    in_rate: u32,
    out_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    /// Leading output samples still to drop for the filter delay.
    skip: usize,
    cursor: u64,
    expected_start: Option<u64>,
}

impl StreamResampler {
    fn new(in_rate: u32, out_rate: u32) -> Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                OUTPUT_RESAMPLE_CHUNK,
            )?)
        };
        Ok(Self {
            in_rate,
            out_rate,
            resampler,
            pending: Vec::new(),
            skip: 0,
            cursor: 0,
            expected_start: None,
        })
    }

    fn reset(&mut self) {
        self.expected_start = None;
    }

    /// Resamples `samples`, scheduled over `start_frame..end_frame` on the device
    /// timeline. Returns where the produced output goes and the output itself.
    fn push(
        &mut self,
        start_frame: u64,
        end_frame: u64,
        samples: &[f32],
    ) -> Result<(u64, Vec<f32>)> {
        if self.expected_start != Some(start_frame) {
            self.pending.clear();
            self.cursor = start_frame;
            self.skip = match self.resampler.as_mut() {
                Some(r) => {
                    r.reset();
                    r.output_delay()
                }
                None => 0,
            };
        }
        self.expected_start = Some(end_frame);

        let mut out = Vec::with_capacity(
            samples.len() * self.out_rate as usize / self.in_rate.max(1) as usize + 1,
        );
        match self.resampler.as_mut() {
            None => out.extend_from_slice(samples),
            Some(r) => {
                self.pending.extend_from_slice(samples);
                let mut consumed = 0;
                while self.pending.len() - consumed >= r.input_frames_next() {
                    let next = consumed + r.input_frames_next();
                    let block = r.process(&[&self.pending[consumed..next]], None)?;
                    consumed = next;
                    if let Some(first) = block.into_iter().next() {
                        out.extend(first);
                    }
                }
                self.pending.drain(..consumed);
            }
        }

        let dropped = self.skip.min(out.len());
        self.skip -= dropped;
        out.drain(..dropped);

        let at = self.cursor;
        self.cursor += out.len() as u64;
        Ok((at, out))
    }
}

struct CpalOutput {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    resampler: StreamResampler,
    stream: StreamThread,
}

impl CpalOutput {
    fn mixer(&self) -> std::sync::MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.mixer().current_time()
    }

    fn schedule(&mut self, id: SourceId, buffer: PcmBuffer, start_at: f64) -> Result<()> {
        let (device_rate, start_frame, end_frame) = {
            let mixer = self.mixer();
            (
                mixer.device_rate,
                mixer.frame_at(start_at),
                mixer.frame_at(start_at + buffer.duration()),
            )
        };
        if self.resampler.in_rate != buffer.sample_rate() || self.resampler.out_rate != device_rate
        {
            self.resampler = StreamResampler::new(buffer.sample_rate(), device_rate)?;
        }
        let (at, samples) = self
            .resampler
            .push(start_frame, end_frame, &buffer.to_mono())?;

        let mut mixer = self.mixer();
        mixer.add(id, at, samples);
        mixer.track(id, end_frame);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        self.resampler.reset();
        self.mixer().remove(id);
    }

    fn close(&mut self) {
        self.resampler.reset();
        self.mixer().clear();
        self.stream.stop();
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    mixer: Arc<Mutex<Mixer>>,
    analyser: Arc<Analyser>,
    on_ended: EndedCallback,
) -> Result<cpal::Stream, SessionError> {
    let output = get_or_default_output(device_name)
        .map_err(|e| SessionError::AudioDevice(format!("{e:#}")))?;
    tracing::info!("Using output device: {:?}", output.name().unwrap_or_default());

    let default_config = output
        .default_output_config()
        .map_err(|e| SessionError::AudioDevice(e.to_string()))?;
    let output_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
    };
    let channel_count = output_config.channels as usize;
    let device_rate = output_config.sample_rate.0;
    tracing::info!("Output stream config: {:?}", &output_config);
    {
        let mut m = mixer.lock().unwrap_or_else(PoisonError::into_inner);
        *m = Mixer::new(device_rate);
    }

    let mut mono = Vec::new();
    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        let frames = data.len() / channel_count.max(1);
        mono.resize(frames, 0.0);
        let ended = mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .render(&mut mono);

        for (frame, sample) in data.chunks_mut(channel_count.max(1)).zip(&mono) {
            frame.iter_mut().for_each(|s| *s = *sample);
        }
        analyser.push(&mono);
        for id in ended {
            on_ended(id);
        }
    };

    let stream = output
        .build_output_stream(
            &output_config,
            output_data_fn,
            move |err| tracing::error!("An error occurred on output stream: {}", err),
            None,
        )
        .map_err(|e| SessionError::AudioDevice(e.to_string()))?;
    stream
        .play()
        .map_err(|e| SessionError::AudioDevice(e.to_string()))?;
    Ok(stream)
}

impl AudioBackend for CpalBackend {
    fn open_microphone(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn StreamHandle>, CaptureError> {
        let device_name = self.input_device.clone();
        let stream = StreamThread::spawn("tta-capture", move || {
            build_input_stream(device_name.as_deref(), sample_rate, frames)
        })
        .map_err(|e| CaptureError::Stream(e.to_string()))??;
        Ok(Box::new(stream))
    }

    fn open_speaker(
        &self,
        sample_rate: u32,
        analyser: Arc<Analyser>,
        on_ended: EndedCallback,
    ) -> Result<Box<dyn AudioOutput>, SessionError> {
        let device_name = self.output_device.clone();
        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
        let stream = {
            let mixer = mixer.clone();
            StreamThread::spawn("tta-playback", move || {
                build_output_stream(device_name.as_deref(), mixer, analyser, on_ended)
            })
            .map_err(|e| SessionError::AudioDevice(e.to_string()))??
        };
        let device_rate = mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .device_rate;
        let resampler = StreamResampler::new(sample_rate, device_rate)
            .map_err(|e| SessionError::AudioDevice(format!("{e:#}")))?;
        Ok(Box::new(CpalOutput {
            sample_rate,
            mixer,
            resampler,
            stream,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[0.2, 0.4, -1.0, 1.0], 2), vec![0.3, 0.0]);
        assert_eq!(downmix(&[0.5, 0.25], 1), vec![0.5, 0.25]);
    }

    #[test]
    fn test_mixer_places_segments_and_reports_scheduled_ends() {
        let mut mixer = Mixer::new(4);
        mixer.add(1, 2, vec![1.0, 1.0]);
        mixer.track(1, 4);
        mixer.add(2, 4, vec![0.5, 0.5, 0.5]);
        mixer.track(2, 7);

        let mut block = vec![0.0; 4];
        // source 1 ends exactly at the block boundary
        assert_eq!(mixer.render(&mut block), vec![1]);
        assert_eq!(block, vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(mixer.current_time(), 1.0);

        let ended = mixer.render(&mut block);
        assert_eq!(block, vec![0.5, 0.5, 0.5, 0.0]);
        assert_eq!(ended, vec![2]);
        assert!(mixer.segments.is_empty());
    }

    #[test]
    fn test_mixer_stop_is_silent_and_never_reports_end() {
        let mut mixer = Mixer::new(4);
        mixer.add(7, 0, vec![0.1; 2]);
        mixer.track(7, 2);
        mixer.add(8, 0, vec![0.1; 8]);
        mixer.track(8, 8);
        mixer.remove(8);

        let mut block = vec![0.0; 4];
        assert_eq!(mixer.render(&mut block), vec![7]);
        assert_eq!(block, vec![0.1, 0.1, 0.0, 0.0]);
        assert!(mixer.render(&mut block).is_empty());
    }

    #[test]
    fn test_same_rate_stream_is_exact() {
        let mut stream = StreamResampler::new(24_000, 24_000).unwrap();
        let (at, out) = stream.push(100, 340, &[0.25; 240]).unwrap();
        assert_eq!((at, out.len()), (100, 240));
        let (at, out) = stream.push(340, 580, &[0.25; 240]).unwrap();
        assert_eq!((at, out.len()), (340, 240));
    }

    #[test]
    fn test_contiguous_chunks_resample_without_gaps() {
        let mut stream = StreamResampler::new(24_000, 48_000).unwrap();
        // two 0.1 s chunks, back to back from 1.0 s
        let (first_at, first) = stream.push(48_000, 52_800, &[0.5; 2400]).unwrap();
        let (second_at, second) = stream.push(52_800, 57_600, &[0.5; 2400]).unwrap();

        assert_eq!(first_at, 48_000);
        assert_eq!(second_at, first_at + first.len() as u64);
        // only the filter delay and the unprocessed remainder are outstanding
        let produced = first.len() + second.len();
        assert!(produced <= 9600);
        assert!(9600 - produced < 2 * OUTPUT_RESAMPLE_CHUNK + 64, "produced {produced}");
        // no fade-in at the chunk boundary
        assert!(second.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }

    #[test]
    fn test_gap_or_reset_restarts_stream_at_new_start() {
        let mut stream = StreamResampler::new(24_000, 48_000).unwrap();
        stream.push(0, 4800, &[0.5; 2400]).unwrap();

        let (at, _) = stream.push(10_000, 14_800, &[0.5; 2400]).unwrap();
        assert_eq!(at, 10_000);

        stream.reset();
        let (at, _) = stream.push(14_800, 19_600, &[0.5; 2400]).unwrap();
        assert_eq!(at, 14_800);
        assert!(stream.pending.len() < OUTPUT_RESAMPLE_CHUNK);
    }
}
