//! Lock-free atomic metrics collection.

use super::TelemetrySnapshot;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Lock-free metrics collection for the pipeline.
///
/// All counters use `Relaxed` ordering; they are independent measurements.
pub struct PipelineMetrics {
    start_time: Instant,

    // === Request metrics ===
    requests_submitted: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    requests_active: AtomicUsize,

    // === Cache metrics ===
    memory_cache_hits: AtomicU64,
    memory_cache_misses: AtomicU64,

    // === Deduplication metrics ===
    /// Load tasks constructed (one per distinct in-flight source)
    load_tasks_created: AtomicU64,
    /// Requests that joined an existing load task
    load_tasks_coalesced: AtomicU64,
    decode_tasks_created: AtomicU64,
    decode_tasks_coalesced: AtomicU64,

    // === Load metrics ===
    loads_started: AtomicU64,
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    loads_active: AtomicUsize,
    bytes_loaded: AtomicU64,

    // === Decode / processing metrics ===
    decodes_completed: AtomicU64,
    decodes_failed: AtomicU64,
    previews_delivered: AtomicU64,
    /// Total decode time in microseconds
    decode_time_us: AtomicU64,
    /// Total processing time in microseconds
    processing_time_us: AtomicU64,
}

impl PipelineMetrics {
    /// Creates a new metrics instance.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_submitted: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            requests_active: AtomicUsize::new(0),
            memory_cache_hits: AtomicU64::new(0),
            memory_cache_misses: AtomicU64::new(0),
            load_tasks_created: AtomicU64::new(0),
            load_tasks_coalesced: AtomicU64::new(0),
            decode_tasks_created: AtomicU64::new(0),
            decode_tasks_coalesced: AtomicU64::new(0),
            loads_started: AtomicU64::new(0),
            loads_completed: AtomicU64::new(0),
            loads_failed: AtomicU64::new(0),
            loads_active: AtomicUsize::new(0),
            bytes_loaded: AtomicU64::new(0),
            decodes_completed: AtomicU64::new(0),
            decodes_failed: AtomicU64::new(0),
            previews_delivered: AtomicU64::new(0),
            decode_time_us: AtomicU64::new(0),
            processing_time_us: AtomicU64::new(0),
        }
    }

    // === Request tracking ===

    /// Record a request entering the pipeline.
    pub fn request_submitted(&self) {
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request delivering its final image.
    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a request delivering an error.
    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a request cancelled by its caller.
    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    // === Cache tracking ===

    pub fn memory_cache_hit(&self) {
        self.memory_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memory_cache_miss(&self) {
        self.memory_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    // === Deduplication tracking ===

    pub fn load_task_created(&self) {
        self.load_tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load_task_coalesced(&self) {
        self.load_tasks_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_task_created(&self) {
        self.decode_tasks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_task_coalesced(&self) {
        self.decode_tasks_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    // === Load tracking ===

    /// Record the data loader being started for a load task.
    pub fn load_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
        self.loads_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk of loaded bytes.
    pub fn bytes_received(&self, bytes: u64) {
        self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn load_completed(&self) {
        self.loads_completed.fetch_add(1, Ordering::Relaxed);
        self.loads_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a load ending in error or cancellation.
    pub fn load_failed(&self) {
        self.loads_failed.fetch_add(1, Ordering::Relaxed);
        self.loads_active.fetch_sub(1, Ordering::Relaxed);
    }

    // === Decode / processing tracking ===

    pub fn decode_completed(&self, duration_us: u64) {
        self.decodes_completed.fetch_add(1, Ordering::Relaxed);
        self.decode_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn preview_delivered(&self) {
        self.previews_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processing_completed(&self, duration_us: u64) {
        self.processing_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Creates a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let uptime = self.start_time.elapsed();
        let uptime_secs = uptime.as_secs_f64().max(0.001);

        let requests_completed = self.requests_completed.load(Ordering::Relaxed);
        let bytes_loaded = self.bytes_loaded.load(Ordering::Relaxed);
        let memory_cache_hits = self.memory_cache_hits.load(Ordering::Relaxed);
        let memory_cache_misses = self.memory_cache_misses.load(Ordering::Relaxed);
        let load_tasks_created = self.load_tasks_created.load(Ordering::Relaxed);
        let load_tasks_coalesced = self.load_tasks_coalesced.load(Ordering::Relaxed);
        let decodes_completed = self.decodes_completed.load(Ordering::Relaxed);
        let decode_time_us = self.decode_time_us.load(Ordering::Relaxed);

        let lookups = memory_cache_hits + memory_cache_misses;
        let memory_cache_hit_rate = if lookups > 0 {
            memory_cache_hits as f64 / lookups as f64
        } else {
            0.0
        };

        let load_joins = load_tasks_created + load_tasks_coalesced;
        let load_coalesce_rate = if load_joins > 0 {
            load_tasks_coalesced as f64 / load_joins as f64
        } else {
            0.0
        };

        let avg_decode_ms = if decodes_completed > 0 {
            decode_time_us as f64 / decodes_completed as f64 / 1000.0
        } else {
            0.0
        };

        TelemetrySnapshot {
            uptime,
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            requests_completed,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed),
            memory_cache_hits,
            memory_cache_misses,
            memory_cache_hit_rate,
            load_tasks_created,
            load_tasks_coalesced,
            load_coalesce_rate,
            decode_tasks_created: self.decode_tasks_created.load(Ordering::Relaxed),
            decode_tasks_coalesced: self.decode_tasks_coalesced.load(Ordering::Relaxed),
            loads_started: self.loads_started.load(Ordering::Relaxed),
            loads_completed: self.loads_completed.load(Ordering::Relaxed),
            loads_failed: self.loads_failed.load(Ordering::Relaxed),
            loads_active: self.loads_active.load(Ordering::Relaxed),
            bytes_loaded,
            decodes_completed,
            decodes_failed: self.decodes_failed.load(Ordering::Relaxed),
            previews_delivered: self.previews_delivered.load(Ordering::Relaxed),
            requests_per_second: requests_completed as f64 / uptime_secs,
            bytes_per_second: bytes_loaded as f64 / uptime_secs,
            avg_decode_ms,
            processing_time_ms: self.processing_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field(
                "requests_active",
                &self.requests_active.load(Ordering::Relaxed),
            )
            .field("loads_active", &self.loads_active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
