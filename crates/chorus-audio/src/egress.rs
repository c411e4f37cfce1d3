//! Egress pipeline: synthesized TTS audio in, media-codec chunks out.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chorus_types::{AudioFormat, CoreError, CoreResult};

use crate::buffer::ChunkQueue;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::transcode::Transcoder;

/// Input sink depth: utterances pending conversion.
const INPUT_QUEUE_CAP: usize = 16;

/// One second of opus at ~64 kbps: the default output buffer budget, and
/// the rate producers pace chunk playout at.
pub const OPUS_BYTES_PER_SECOND: usize = 8 * 1024;

/// One item on the egress output.
#[derive(Debug, Clone, PartialEq)]
pub enum EgressItem {
    /// A converted chunk, at most the configured egress buffer size.
    Chunk(Vec<u8>),
    /// All chunks of one pushed utterance have been emitted.
    UtteranceEnd,
}

/// TTS audio → opus 48 kHz mono chunk stream.
///
/// One input sink, one output source. Converted audio is cut into chunks
/// of the configured egress buffer size, followed by an
/// [`EgressItem::UtteranceEnd`] marker per pushed utterance. The output
/// queue holds about one second of audio and drops oldest on overflow.
/// Closing the input ends the output stream after the final partial
/// chunk; dropping the pipeline cancels any in-flight conversion.
pub struct EgressPipeline {
    input_tx: Mutex<Option<mpsc::Sender<(Vec<u8>, AudioFormat)>>>,
    output: Arc<ChunkQueue<EgressItem>>,
    stats: Arc<PipelineStats>,
    task: JoinHandle<()>,
}

impl EgressPipeline {
    /// Spawn a pipeline with the default output budget.
    pub fn new(transcoder: Arc<dyn Transcoder>, chunk_bytes: usize) -> Self {
        // The marker items are free; budget only counts audio chunks.
        let queue_cap = (OPUS_BYTES_PER_SECOND / chunk_bytes.max(1)).max(1) + 1;
        Self::with_queue_cap(transcoder, chunk_bytes, queue_cap)
    }

    /// Spawn a pipeline with an explicit output queue depth (in items).
    pub fn with_queue_cap(
        transcoder: Arc<dyn Transcoder>,
        chunk_bytes: usize,
        queue_cap: usize,
    ) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        let (input_tx, mut input_rx) = mpsc::channel::<(Vec<u8>, AudioFormat)>(INPUT_QUEUE_CAP);
        let output = ChunkQueue::new(queue_cap);
        let stats = Arc::new(PipelineStats::new());

        let worker_output = Arc::clone(&output);
        let worker_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            while let Some((bytes, format)) = input_rx.recv().await {
                worker_stats.add_bytes_in(bytes.len());
                let started = std::time::Instant::now();
                let converted = match transcoder
                    .transcode(&bytes, format, AudioFormat::Opus48k)
                    .await
                {
                    Ok(converted) => converted,
                    Err(e) => {
                        worker_stats.add_error();
                        warn!(error = %e, input_bytes = bytes.len(), "egress transcode failed");
                        // The marker still goes out so a waiting speaker
                        // turn can finish instead of hanging.
                        worker_output.push(EgressItem::UtteranceEnd);
                        continue;
                    }
                };
                worker_stats
                    .latency
                    .record(started.elapsed().as_millis() as u64);
                worker_stats.add_bytes_out(converted.len());

                for chunk in converted.chunks(chunk_bytes) {
                    worker_stats.add_chunk();
                    if worker_output.push(EgressItem::Chunk(chunk.to_vec())).is_some() {
                        debug!("egress output overflow, oldest item dropped");
                    }
                }
                worker_output.push(EgressItem::UtteranceEnd);
            }
            // Input closed: end of stream after the last chunk drains.
            worker_output.close();
        });

        Self {
            input_tx: Mutex::new(Some(input_tx)),
            output,
            stats,
            task,
        }
    }

    /// Feed one piece of synthesized audio into the pipeline.
    pub async fn push(&self, bytes: Vec<u8>, format: AudioFormat) -> CoreResult<()> {
        let tx = self
            .input_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| CoreError::Cancelled("egress input is closed".into()))?;
        tx.send((bytes, format))
            .await
            .map_err(|_| CoreError::Cancelled("egress worker is gone".into()))
    }

    /// Close the input sink; the output drains and then ends.
    pub fn close_input(&self) {
        if let Ok(mut guard) = self.input_tx.lock() {
            *guard = None;
        }
    }

    /// Next output item, or `None` once the input is closed and drained.
    pub async fn next_item(&self) -> Option<EgressItem> {
        self.output.pop().await
    }

    /// Handle to the output queue, for wiring into a producer task.
    pub fn output(&self) -> Arc<ChunkQueue<EgressItem>> {
        Arc::clone(&self.output)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for EgressPipeline {
    fn drop(&mut self) {
        self.task.abort();
        self.output.close();
    }
}
