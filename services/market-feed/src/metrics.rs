//! Feed engine counters
//!
//! Lock-free counters shared between the worker and readers through an
//! `Arc`. Every self-healed anomaly (malformed frame, stale epoch, gap,
//! overflow) is only visible here and in the logs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core metrics for the feed engine.
#[derive(Debug)]
pub struct FeedMetrics {
    // Ingestion
    pub frames_ingested: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub stale_epoch_discards: AtomicU64,
    pub ingest_ns: Mutex<LatencyTracker>,

    // Sequencing
    pub duplicates: AtomicU64,
    pub gaps: AtomicU64,
    pub resync_requests: AtomicU64,
    pub buffer_overflows: AtomicU64,

    // Publication
    pub versions_published: AtomicU64,

    // Lifecycle
    pub reconnect_attempts: AtomicU64,
    pub evictions: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            frames_ingested: AtomicU64::new(0),
            frames_malformed: AtomicU64::new(0),
            stale_epoch_discards: AtomicU64::new(0),
            ingest_ns: Mutex::new(LatencyTracker::new(1000)),
            duplicates: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
            resync_requests: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            versions_published: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record a frame that made it through parsing.
    pub fn record_ingested(&self, latency_ns: u64) {
        self.frames_ingested.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.ingest_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_epoch(&self) {
        self.stale_epoch_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync_request(&self) {
        self.resync_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffer_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.versions_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut m = BTreeMap::new();
        m.insert("frames_ingested".to_string(), load(&self.frames_ingested));
        m.insert("frames_malformed".to_string(), load(&self.frames_malformed));
        m.insert("stale_epoch_discards".to_string(), load(&self.stale_epoch_discards));
        m.insert("duplicates".to_string(), load(&self.duplicates));
        m.insert("gaps".to_string(), load(&self.gaps));
        m.insert("resync_requests".to_string(), load(&self.resync_requests));
        m.insert("buffer_overflows".to_string(), load(&self.buffer_overflows));
        m.insert("versions_published".to_string(), load(&self.versions_published));
        m.insert("reconnect_attempts".to_string(), load(&self.reconnect_attempts));
        m.insert("evictions".to_string(), load(&self.evictions));

        if let Ok(tracker) = self.ingest_ns.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("ingest_p50_ns".to_string(), p50);
                m.insert("ingest_samples".to_string(), tracker.count() as u64);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("ingest_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile (0-100) over the window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let len = sorted.len();
        let rank = (p.min(100) * len).div_ceil(100).clamp(1, len);
        sorted.get(rank - 1).copied()
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
