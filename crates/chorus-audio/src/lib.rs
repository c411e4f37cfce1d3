//! Per-binding audio pipelines.
//!
//! Every agent↔room binding owns two unidirectional pipelines:
//!
//! - **Egress** ([`EgressPipeline`]): synthesized TTS audio (mp3) in,
//!   media-codec chunks (opus 48 kHz mono) out, sized for the media client.
//! - **Ingress** ([`IngressPipeline`]): consumed room audio (opus) in,
//!   STT-ready PCM buckets (s16le 16 kHz mono) out, each labeled by the
//!   voice-activity detector.
//!
//! Both are strictly one input sink, one output source. Closing the input
//! flushes a final partial chunk; dropping the pipeline cancels any
//! in-flight conversion. Each maintains counters and a rolling latency
//! histogram over its transformation stage.
//!
//! Codec work happens behind the [`Transcoder`] seam; the production
//! implementation drives an `ffmpeg` subprocess, tests use a PCM
//! passthrough.

pub mod buffer;
pub mod egress;
pub mod ingress;
pub mod stats;
pub mod transcode;
pub mod vad;

pub use buffer::{ChunkPool, ChunkQueue};
pub use egress::{EgressItem, EgressPipeline, OPUS_BYTES_PER_SECOND};
pub use ingress::{IngressChunk, IngressPipeline};
pub use stats::{LatencyHistogram, LatencySummary, PipelineStats, StatsSnapshot};
pub use transcode::{FfmpegTranscoder, PcmPassthrough, Transcoder};
pub use vad::VoiceActivityDetector;
