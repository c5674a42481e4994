use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rustfft::{FftPlanner, num_complex::Complex};
use tta_native_utils::audio::calculate_volume;

/// Window size of the capture analyser.
pub const INPUT_FFT_SIZE: usize = 2048;
/// Window size of the playback analyser.
pub const OUTPUT_FFT_SIZE: usize = 256;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Keeps the most recent window of samples flowing through a stream.
#[derive(Debug)]
pub struct Analyser {
    fft_size: usize,
    window: Mutex<VecDeque<f32>>,
}

impl Analyser {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        Self {
            fft_size,
            window: Mutex::new(VecDeque::from(vec![0.0; fft_size])),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn push(&self, samples: &[f32]) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let skip = samples.len().saturating_sub(self.fft_size);
        window.extend(&samples[skip..]);
        while window.len() > self.fft_size {
            window.pop_front();
        }
    }

    /// Clears the window back to silence.
    pub fn reset(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.iter_mut().for_each(|s| *s = 0.0);
        }
    }

    pub fn time_domain_data(&self) -> Vec<f32> {
        self.window
            .lock()
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current level of the window, in [0, 1].
    pub fn level(&self) -> f32 {
        calculate_volume(&self.time_domain_data())
    }

    /// Hann-windowed magnitude spectrum scaled to bytes between -100 dB and -30 dB.
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let samples = self.time_domain_data();
        let n = samples.len();
        let mut buf: Vec<Complex<f32>> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let w = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos();
                Complex { re: s * w, im: 0.0 }
            })
            .collect();

        let mut planner: FftPlanner<f32> = FftPlanner::new();
        planner.plan_fft_forward(n).process(&mut buf);

        buf[..self.frequency_bin_count()]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / n as f32;
                let db = 20.0 * magnitude.max(1e-12).log10();
                let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
                (scaled.clamp(0.0, 1.0) * 255.0) as u8
            })
            .collect()
    }
}

/// Shared raw audio level, written by the level tracker and read by presentation.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter {
    bits: Arc<AtomicU32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        self.bits
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_latest_samples() {
        let analyser = Analyser::new(4);
        analyser.push(&[1.0, 2.0]);
        assert_eq!(analyser.time_domain_data(), vec![0.0, 0.0, 1.0, 2.0]);
        analyser.push(&[3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(analyser.time_domain_data(), vec![4.0, 5.0, 6.0, 7.0]);
        analyser.reset();
        assert_eq!(analyser.level(), 0.0);
    }

    #[test]
    fn test_level_tracks_loudness() {
        let analyser = Analyser::new(OUTPUT_FFT_SIZE);
        assert_eq!(analyser.level(), 0.0);
        analyser.push(&vec![0.5; OUTPUT_FFT_SIZE]);
        assert_eq!(analyser.level(), 1.0);
    }

    #[test]
    fn test_frequency_data_peaks_at_tone() {
        let analyser = Analyser::new(256);
        let tone: Vec<f32> = (0..256)
            .map(|i| 0.01 * (2.0 * std::f32::consts::PI * 16.0 * i as f32 / 256.0).sin())
            .collect();
        analyser.push(&tone);
        let bins = analyser.byte_frequency_data();
        assert_eq!(bins.len(), 128);
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn test_level_meter_clamps() {
        let meter = LevelMeter::new();
        meter.set(3.0);
        assert_eq!(meter.get(), 1.0);
        meter.set(0.25);
        assert_eq!(meter.get(), 0.25);
    }
}
