//! Audio format vocabulary shared by the provider adapters, the pipelines,
//! and the media boundary.

use serde::{Deserialize, Serialize};

/// Audio formats crossing chorus component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// MPEG Layer-3, as produced by TTS providers (typically 24 kHz mono).
    Mp3,
    /// Opus in an Ogg container at 48 kHz mono, the media-server codec.
    Opus48k,
    /// Raw signed 16-bit little-endian PCM at 16 kHz mono, the STT input.
    Pcm16k,
    /// WAV container around 16-bit PCM.
    Wav,
}

impl AudioFormat {
    /// MIME type for this format.
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Opus48k => "audio/ogg",
            AudioFormat::Pcm16k => "audio/L16",
            AudioFormat::Wav => "audio/wav",
        }
    }

    /// Nominal sample rate in Hz.
    pub fn sample_rate(self) -> u32 {
        match self {
            AudioFormat::Mp3 => 24_000,
            AudioFormat::Opus48k => 48_000,
            AudioFormat::Pcm16k => 16_000,
            AudioFormat::Wav => 16_000,
        }
    }

    /// Whether the format is raw PCM (no container or codec framing).
    pub fn is_raw_pcm(self) -> bool {
        matches!(self, AudioFormat::Pcm16k)
    }

    /// Parse a loose format string.
    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "opus" | "opus48k" | "ogg" => Some(AudioFormat::Opus48k),
            "pcm" | "pcm16k" | "pcm_16khz" | "s16le" => Some(AudioFormat::Pcm16k),
            "wav" => Some(AudioFormat::Wav),
            _ => None,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Opus48k => "opus",
            AudioFormat::Pcm16k => "pcm16k",
            AudioFormat::Wav => "wav",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_and_display() {
        assert_eq!(AudioFormat::from_str_lossy("MP3"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::from_str_lossy("opus"), Some(AudioFormat::Opus48k));
        assert_eq!(AudioFormat::from_str_lossy("pcm_16khz"), Some(AudioFormat::Pcm16k));
        assert_eq!(AudioFormat::from_str_lossy("flac"), None);
        assert_eq!(AudioFormat::Opus48k.to_string(), "opus");
    }

    #[test]
    fn format_properties() {
        assert_eq!(AudioFormat::Opus48k.sample_rate(), 48_000);
        assert_eq!(AudioFormat::Pcm16k.sample_rate(), 16_000);
        assert!(AudioFormat::Pcm16k.is_raw_pcm());
        assert!(!AudioFormat::Mp3.is_raw_pcm());
        assert_eq!(AudioFormat::Mp3.mime_type(), "audio/mpeg");
    }
}
