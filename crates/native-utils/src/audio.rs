use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate of the PCM16 audio the live service accepts from the microphone.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the PCM16 audio the live service streams back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Mime type attached to every outbound microphone frame.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Encodes raw bytes into the base64 transport representation.
pub fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decodes a base64 transport string back into raw bytes.
pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data)
}

/// Converts f32 samples in [-1, 1] to PCM16, saturating at the i16 range.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts PCM16 samples to f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Interprets little-endian byte pairs as PCM16 values. A trailing odd byte is dropped.
pub fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// A trait for converting audio sample types to a binary representation (Vec<u8>).
pub trait ToBinary {
    fn to_binary(&self) -> Vec<u8>;
}

impl ToBinary for [i16] {
    fn to_binary(&self) -> Vec<u8> {
        self.iter()
            .flat_map(|&sample| sample.to_le_bytes())
            .collect()
    }
}

impl ToBinary for [f32] {
    fn to_binary(&self) -> Vec<u8> {
        convert_f32_to_i16(self).to_binary()
    }
}

/// Encodes f32 samples as base64 PCM16.
pub fn encode_f32(pcm32: &[f32]) -> String {
    encode(&pcm32.to_binary())
}

/// A decoded, playable block of audio. Samples are stored per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Duration in seconds, `frames / sample_rate`.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Averages all channels down to a single one.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// Turns interleaved little-endian PCM16 bytes into a playable buffer.
pub fn decode_to_buffer(bytes: &[u8], sample_rate: u32, channels: usize) -> PcmBuffer {
    let channels = channels.max(1);
    let pcm16 = bytes_to_i16(bytes);
    let frames = pcm16.len() / channels;

    let mut data = vec![Vec::with_capacity(frames); channels];
    for frame in pcm16.chunks_exact(channels) {
        for (channel, &sample) in data.iter_mut().zip(frame) {
            channel.push(sample as f32 / 32768.0);
        }
    }
    PcmBuffer::new(sample_rate, data)
}

/// Extracts the `rate=` parameter of an `audio/pcm;rate=N` mime type.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("rate="))
        .and_then(|rate| rate.trim().parse().ok())
}

/// RMS volume of a block of samples, scaled into [0, 1].
pub fn calculate_volume(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    ((sum / samples.len() as f32).sqrt() * 10.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip_is_lossless() {
        let bytes: Vec<u8> = (0..=255u8).chain([0, 1, 254, 255, 128]).collect();
        let encoded = encode(&bytes);
        assert_eq!(decode(&encoded).unwrap(), bytes);

        let odd = [7u8, 9, 11];
        assert_eq!(decode(&encode(&odd)).unwrap(), odd);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("%%% not base64 %%%").is_err());
    }

    #[test]
    fn test_f32_to_i16_saturates() {
        let pcm = convert_f32_to_i16(&[1.0, -1.0, 2.5, -3.0, 0.0, 0.5]);
        assert_eq!(pcm, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN, 0, 16384]);
    }

    #[test]
    fn test_decode_to_buffer_duration_matches_sample_count() {
        let samples: Vec<i16> = vec![0, 16384, -16384, 32767];
        let bytes = samples.to_binary();
        let buffer = decode_to_buffer(&bytes, 24_000, 1);
        assert_eq!(buffer.frames(), 4);
        assert_eq!(buffer.duration(), 4.0 / 24_000.0);
        assert_eq!(buffer.channel(0).unwrap()[1], 0.5);
        assert_eq!(buffer.channel(0).unwrap()[2], -0.5);

        let one_second = vec![0u8; 24_000 * 2];
        assert_eq!(decode_to_buffer(&one_second, 24_000, 1).duration(), 1.0);
    }

    #[test]
    fn test_decode_to_buffer_deinterleaves_stereo() {
        let samples: Vec<i16> = vec![100, -100, 200, -200];
        let buffer = decode_to_buffer(&samples.to_binary(), 16_000, 2);
        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(0).unwrap(), &[100.0 / 32768.0, 200.0 / 32768.0]);
        assert_eq!(buffer.channel(1).unwrap(), &[-100.0 / 32768.0, -200.0 / 32768.0]);
        assert_eq!(buffer.to_mono(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_parse_pcm_rate() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
    }

    #[test]
    fn test_calculate_volume_is_bounded() {
        assert_eq!(calculate_volume(&[]), 0.0);
        assert_eq!(calculate_volume(&[0.0; 64]), 0.0);
        assert_eq!(calculate_volume(&[0.9; 64]), 1.0);
        let quiet = calculate_volume(&[0.01; 64]);
        assert!((quiet - 0.1).abs() < 1e-4);
    }
}
