//! Codec conversion behind a trait seam.
//!
//! The production [`FfmpegTranscoder`] drives an `ffmpeg` subprocess over
//! stdin/stdout pipes; each call is one self-contained conversion. The
//! binary is probed once at construction, so a host without ffmpeg comes
//! up with the transcoder unavailable instead of failing later on the hot
//! path. [`PcmPassthrough`] is the test double.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use chorus_types::{AudioFormat, CoreError, CoreResult};

/// Upper bound on one conversion, independent of input size.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Transcoder trait
// ---------------------------------------------------------------------------

/// Stateless audio format conversion.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` from one format to another.
    async fn transcode(
        &self,
        input: &[u8],
        from: AudioFormat,
        to: AudioFormat,
    ) -> CoreResult<Vec<u8>>;

    /// Whether the transcoder can run on this host.
    fn is_available(&self) -> bool;
}

// ---------------------------------------------------------------------------
// FfmpegTranscoder
// ---------------------------------------------------------------------------

/// Subprocess-based transcoder using the system `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    bin: String,
    available: bool,
}

impl FfmpegTranscoder {
    /// Probe `ffmpeg` on PATH.
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    /// Probe a specific binary.
    pub fn with_binary(bin: impl Into<String>) -> Self {
        let bin = bin.into();
        let available = std::process::Command::new(&bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            tracing::warn!(bin = %bin, "ffmpeg not found, audio transcoding unavailable");
        }
        Self { bin, available }
    }

    /// Demuxer arguments describing the input format.
    fn input_args(format: AudioFormat) -> Vec<&'static str> {
        match format {
            AudioFormat::Mp3 => vec!["-f", "mp3"],
            AudioFormat::Opus48k => vec!["-f", "ogg"],
            AudioFormat::Pcm16k => vec!["-f", "s16le", "-ar", "16000", "-ac", "1"],
            AudioFormat::Wav => vec!["-f", "wav"],
        }
    }

    /// Muxer/encoder arguments for the output format.
    fn output_args(format: AudioFormat) -> Vec<&'static str> {
        match format {
            AudioFormat::Mp3 => vec!["-f", "mp3", "-ar", "24000", "-ac", "1"],
            AudioFormat::Opus48k => vec![
                "-f", "ogg", "-c:a", "libopus", "-ar", "48000", "-ac", "1", "-b:a", "64k",
            ],
            AudioFormat::Pcm16k => vec!["-f", "s16le", "-ar", "16000", "-ac", "1"],
            AudioFormat::Wav => vec!["-f", "wav", "-ar", "16000", "-ac", "1"],
        }
    }

    /// Full argument list for one conversion over stdio pipes.
    pub fn build_args(from: AudioFormat, to: AudioFormat) -> Vec<&'static str> {
        let mut args = vec!["-hide_banner", "-loglevel", "error", "-nostdin"];
        args.extend(Self::input_args(from));
        args.extend(["-i", "pipe:0"]);
        args.extend(Self::output_args(to));
        args.push("pipe:1");
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &[u8],
        from: AudioFormat,
        to: AudioFormat,
    ) -> CoreResult<Vec<u8>> {
        if !self.available {
            return Err(CoreError::ProviderUnavailable(format!(
                "{} is not installed",
                self.bin
            )));
        }
        if input.is_empty() {
            return Err(CoreError::InvalidArgument("empty audio input".into()));
        }
        if from == to {
            return Ok(input.to_vec());
        }

        let args = Self::build_args(from, to);
        debug!(%from, %to, input_bytes = input.len(), "transcoding");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::ProviderError(format!("failed to spawn {}: {e}", self.bin)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::ProviderError("no stdin pipe".into()))?;

        // Feed input from a separate task so a full stdout pipe cannot
        // deadlock against a full stdin pipe.
        let input = input.to_vec();
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        let run = async {
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| CoreError::ProviderError("no stdout pipe".into()))?;
            let mut output = Vec::new();
            stdout
                .read_to_end(&mut output)
                .await
                .map_err(|e| CoreError::ProviderError(format!("pipe read failed: {e}")))?;

            let status = child
                .wait()
                .await
                .map_err(|e| CoreError::ProviderError(format!("ffmpeg wait failed: {e}")))?;
            if !status.success() {
                let mut stderr_text = String::new();
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = stderr.read_to_string(&mut stderr_text).await;
                }
                return Err(CoreError::ProviderError(format!(
                    "ffmpeg exited with {status}: {}",
                    stderr_text.trim()
                )));
            }
            Ok(output)
        };

        let result = tokio::time::timeout(TRANSCODE_TIMEOUT, run)
            .await
            .map_err(|_| CoreError::ProviderError("transcode timed out".into()))?;
        writer.abort();
        result
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

// ---------------------------------------------------------------------------
// PcmPassthrough
// ---------------------------------------------------------------------------

/// Test transcoder that returns its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PcmPassthrough;

#[async_trait]
impl Transcoder for PcmPassthrough {
    async fn transcode(
        &self,
        input: &[u8],
        _from: AudioFormat,
        _to: AudioFormat,
    ) -> CoreResult<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_for_egress_conversion() {
        let args = FfmpegTranscoder::build_args(AudioFormat::Mp3, AudioFormat::Opus48k);
        let joined = args.join(" ");
        assert!(joined.contains("-f mp3 -i pipe:0"));
        assert!(joined.contains("libopus"));
        assert!(joined.contains("-ar 48000"));
        assert!(joined.contains("-b:a 64k"));
        assert!(joined.ends_with("pipe:1"));
    }

    #[test]
    fn args_for_ingress_conversion() {
        let args = FfmpegTranscoder::build_args(AudioFormat::Opus48k, AudioFormat::Pcm16k);
        let joined = args.join(" ");
        assert!(joined.contains("-f ogg -i pipe:0"));
        assert!(joined.contains("-f s16le -ar 16000 -ac 1 pipe:1"));
    }

    #[tokio::test]
    async fn passthrough_is_identity() {
        let t = PcmPassthrough;
        let out = t
            .transcode(b"pcm bytes", AudioFormat::Pcm16k, AudioFormat::Opus48k)
            .await
            .unwrap();
        assert_eq!(out, b"pcm bytes");
        assert!(t.is_available());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let t = FfmpegTranscoder::with_binary("chorus-no-such-ffmpeg-binary");
        assert!(!t.is_available());
        let err = t
            .transcode(b"x", AudioFormat::Mp3, AudioFormat::Opus48k)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn same_format_short_circuits() {
        // Works even without ffmpeg installed because no conversion runs.
        let t = FfmpegTranscoder::with_binary("chorus-no-such-ffmpeg-binary");
        let t = FfmpegTranscoder {
            available: true,
            ..t
        };
        let out = t
            .transcode(b"abc", AudioFormat::Mp3, AudioFormat::Mp3)
            .await
            .unwrap();
        assert_eq!(out, b"abc");
    }
}
