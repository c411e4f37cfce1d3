//! Energy-based voice-activity detection over signed 16-bit PCM.

/// RMS level of an s16le buffer, normalized to [0.0, 1.0] of full scale.
///
/// Odd trailing bytes are ignored.
pub fn rms_level(pcm: &[u8]) -> f32 {
    let sample_count = pcm.len() / 2;
    if sample_count == 0 {
        return 0.0;
    }
    let mut sum_squares = 0.0f64;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64;
        sum_squares += sample * sample;
    }
    let rms = (sum_squares / sample_count as f64).sqrt();
    (rms / i16::MAX as f64) as f32
}

/// Threshold-based voice-activity detector.
#[derive(Debug, Clone, Copy)]
pub struct VoiceActivityDetector {
    /// RMS threshold as a fraction of 16-bit full scale.
    threshold: f32,
}

impl VoiceActivityDetector {
    /// Detector with the given RMS threshold.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Whether the buffer's energy crosses the voice threshold.
    pub fn is_voice(&self, pcm: &[u8]) -> bool {
        rms_level(pcm) >= self.threshold
    }

    /// The configured threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}
