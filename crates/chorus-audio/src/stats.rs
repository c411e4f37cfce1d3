//! Pipeline observability: counters and a rolling latency histogram.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Number of latency samples retained.
const HISTOGRAM_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// LatencyHistogram
// ---------------------------------------------------------------------------

/// Rolling window over the last [`HISTOGRAM_WINDOW`] stage latencies.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    samples: Mutex<VecDeque<u64>>,
}

/// Summary of the current latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one stage latency in milliseconds.
    pub fn record(&self, latency_ms: u64) {
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() == HISTOGRAM_WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency_ms);
    }

    /// Summarize the current window.
    pub fn summary(&self) -> LatencySummary {
        let Ok(samples) = self.samples.lock() else {
            return LatencySummary::default();
        };
        if samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let p95_idx = ((count as f64) * 0.95).ceil() as usize - 1;
        LatencySummary {
            samples: count,
            mean_ms: sum / count as u64,
            p95_ms: sorted[p95_idx.min(count - 1)],
            max_ms: sorted[count - 1],
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineStats
// ---------------------------------------------------------------------------

/// Counters maintained by each pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub chunks_emitted: AtomicU64,
    pub voice_segments: AtomicU64,
    pub silence_segments: AtomicU64,
    pub errors: AtomicU64,
    pub latency: LatencyHistogram,
}

/// Point-in-time copy of pipeline counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub chunks_emitted: u64,
    pub voice_segments: u64,
    pub silence_segments: u64,
    pub errors: u64,
    pub latency: LatencySummary,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_chunk(&self) {
        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_voice_segment(&self, is_voice: bool) {
        if is_voice {
            self.voice_segments.fetch_add(1, Ordering::Relaxed);
        } else {
            self.silence_segments.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            voice_segments: self.voice_segments.load(Ordering::Relaxed),
            silence_segments: self.silence_segments.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency: self.latency.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_empty_summary() {
        let hist = LatencyHistogram::new();
        assert_eq!(hist.summary(), LatencySummary::default());
    }

    #[test]
    fn histogram_summarizes_window() {
        let hist = LatencyHistogram::new();
        for ms in [10, 20, 30, 40] {
            hist.record(ms);
        }
        let summary = hist.summary();
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.mean_ms, 25);
        assert_eq!(summary.max_ms, 40);
    }

    #[test]
    fn histogram_evicts_beyond_window() {
        let hist = LatencyHistogram::new();
        for ms in 0..(HISTOGRAM_WINDOW as u64 + 50) {
            hist.record(ms);
        }
        let summary = hist.summary();
        assert_eq!(summary.samples, HISTOGRAM_WINDOW);
        // The oldest 50 samples are gone.
        assert_eq!(summary.max_ms, HISTOGRAM_WINDOW as u64 + 49);
    }

    #[test]
    fn stats_counters_accumulate() {
        let stats = PipelineStats::new();
        stats.add_bytes_in(100);
        stats.add_bytes_out(80);
        stats.add_chunk();
        stats.add_chunk();
        stats.add_voice_segment(true);
        stats.add_voice_segment(false);
        stats.add_error();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.bytes_out, 80);
        assert_eq!(snap.chunks_emitted, 2);
        assert_eq!(snap.voice_segments, 1);
        assert_eq!(snap.silence_segments, 1);
        assert_eq!(snap.errors, 1);
    }
}
