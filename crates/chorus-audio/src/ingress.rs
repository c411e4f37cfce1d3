//! Ingress pipeline: consumed room audio in, VAD-labeled PCM buckets out.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chorus_types::{AudioFormat, CoreError, CoreResult};

use crate::buffer::{ChunkPool, ChunkQueue};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::transcode::Transcoder;
use crate::vad::VoiceActivityDetector;

/// Input sink depth: captured segments pending conversion.
const INPUT_QUEUE_CAP: usize = 16;

/// PCM s16le 16 kHz mono byte rate.
const PCM_BYTES_PER_SECOND: usize = 16_000 * 2;

/// One STT-ready bucket of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressChunk {
    /// s16le 16 kHz mono samples.
    pub pcm: Vec<u8>,
    /// Whether the VAD heard voice energy in this bucket.
    pub is_voice: bool,
}

/// Room audio (opus) → VAD-labeled PCM bucket stream.
///
/// Buckets are aligned to the configured duration; the final bucket on
/// input close may be partial. The output queue holds about one second of
/// audio and drops oldest on overflow.
pub struct IngressPipeline {
    input_tx: std::sync::Mutex<Option<mpsc::Sender<(Vec<u8>, AudioFormat)>>>,
    output: Arc<ChunkQueue<IngressChunk>>,
    stats: Arc<PipelineStats>,
    task: JoinHandle<()>,
}

impl IngressPipeline {
    /// Spawn a pipeline with the default output budget.
    pub fn new(transcoder: Arc<dyn Transcoder>, bucket_ms: u64, vad_threshold: f32) -> Self {
        let bucket_bytes = Self::bucket_bytes(bucket_ms);
        let queue_cap = (PCM_BYTES_PER_SECOND / bucket_bytes.max(1)).max(1);
        Self::with_queue_cap(transcoder, bucket_ms, vad_threshold, queue_cap)
    }

    /// Spawn a pipeline with an explicit output queue depth (in buckets).
    pub fn with_queue_cap(
        transcoder: Arc<dyn Transcoder>,
        bucket_ms: u64,
        vad_threshold: f32,
        queue_cap: usize,
    ) -> Self {
        let bucket_bytes = Self::bucket_bytes(bucket_ms);
        let vad = VoiceActivityDetector::new(vad_threshold);
        let (input_tx, mut input_rx) = mpsc::channel::<(Vec<u8>, AudioFormat)>(INPUT_QUEUE_CAP);
        let output = ChunkQueue::new(queue_cap);
        let stats = Arc::new(PipelineStats::new());

        let worker_output = Arc::clone(&output);
        let worker_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            // Buckets recycle through a small freelist; an overflow-dropped
            // bucket goes straight back to it.
            let pool = ChunkPool::new(bucket_bytes, queue_cap + 1);
            let mut pending: Vec<u8> = Vec::new();
            while let Some((bytes, format)) = input_rx.recv().await {
                worker_stats.add_bytes_in(bytes.len());
                let started = std::time::Instant::now();
                let pcm = match transcoder
                    .transcode(&bytes, format, AudioFormat::Pcm16k)
                    .await
                {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        worker_stats.add_error();
                        warn!(error = %e, input_bytes = bytes.len(), "ingress transcode failed");
                        continue;
                    }
                };
                worker_stats
                    .latency
                    .record(started.elapsed().as_millis() as u64);

                pending.extend_from_slice(&pcm);
                while pending.len() >= bucket_bytes {
                    let mut bucket = pool.take();
                    bucket.extend_from_slice(&pending[..bucket_bytes]);
                    pending.drain(..bucket_bytes);
                    emit(&worker_output, &worker_stats, &vad, &pool, bucket);
                }
            }
            // Input closed: flush the final partial bucket.
            if !pending.is_empty() {
                emit(&worker_output, &worker_stats, &vad, &pool, pending);
            }
            worker_output.close();
        });

        fn emit(
            output: &ChunkQueue<IngressChunk>,
            stats: &PipelineStats,
            vad: &VoiceActivityDetector,
            pool: &ChunkPool,
            pcm: Vec<u8>,
        ) {
            let is_voice = vad.is_voice(&pcm);
            stats.add_bytes_out(pcm.len());
            stats.add_chunk();
            stats.add_voice_segment(is_voice);
            if let Some(dropped) = output.push(IngressChunk { pcm, is_voice }) {
                debug!("ingress output overflow, oldest bucket dropped");
                pool.give_back(dropped.pcm);
            }
        }

        Self {
            input_tx: std::sync::Mutex::new(Some(input_tx)),
            output,
            stats,
            task,
        }
    }

    /// Bucket size in bytes for a duration at the STT sample rate.
    pub fn bucket_bytes(bucket_ms: u64) -> usize {
        ((PCM_BYTES_PER_SECOND as u64 * bucket_ms) / 1000).max(2) as usize
    }

    /// Feed one captured audio segment into the pipeline.
    pub async fn push(&self, bytes: Vec<u8>, format: AudioFormat) -> CoreResult<()> {
        let tx = self
            .input_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| CoreError::Cancelled("ingress input is closed".into()))?;
        tx.send((bytes, format))
            .await
            .map_err(|_| CoreError::Cancelled("ingress worker is gone".into()))
    }

    /// Close the input sink; the final partial bucket is flushed.
    pub fn close_input(&self) {
        if let Ok(mut guard) = self.input_tx.lock() {
            *guard = None;
        }
    }

    /// Next bucket, or `None` once the input is closed and drained.
    pub async fn next_chunk(&self) -> Option<IngressChunk> {
        self.output.pop().await
    }

    /// Handle to the output queue, for wiring into an STT feed task.
    pub fn output(&self) -> Arc<ChunkQueue<IngressChunk>> {
        Arc::clone(&self.output)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for IngressPipeline {
    fn drop(&mut self) {
        self.task.abort();
        self.output.close();
    }
}
