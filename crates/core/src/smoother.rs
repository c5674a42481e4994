/// Per-frame interpolation factor. Lower is smoother, higher is more responsive.
pub const SMOOTHING_FACTOR: f32 = 0.15;

/// Exponential moving average of the raw audio level, stepped once per frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmplitudeSmoother {
    value: f32,
}

impl AmplitudeSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn step(&mut self, raw: f32) -> f32 {
        self.value += (raw - self.value) * SMOOTHING_FACTOR;
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Talking-video playback rate for a smoothed level: near silence rests at 0.5x,
/// speech maps linearly into [0.7, 1.8].
pub fn lip_sync_rate(smoothed: f32) -> f32 {
    if smoothed < 0.01 {
        0.5
    } else {
        (0.7 + smoothed * 1.5).clamp(0.7, 1.8)
    }
}
