//! Point-in-time telemetry snapshot.

use std::fmt;
use std::time::Duration;

/// A point-in-time copy of [`PipelineMetrics`](super::PipelineMetrics).
///
/// Rates are computed from uptime when the snapshot is taken.
#[derive(Clone, Debug, Default)]
pub struct TelemetrySnapshot {
    pub uptime: Duration,

    // === Requests ===
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub requests_active: usize,

    // === Cache ===
    pub memory_cache_hits: u64,
    pub memory_cache_misses: u64,
    /// Memory cache hit rate (0.0 - 1.0)
    pub memory_cache_hit_rate: f64,

    // === Deduplication ===
    pub load_tasks_created: u64,
    pub load_tasks_coalesced: u64,
    /// Fraction of load acquisitions that joined an existing task (0.0 - 1.0)
    pub load_coalesce_rate: f64,
    pub decode_tasks_created: u64,
    pub decode_tasks_coalesced: u64,

    // === Loading ===
    pub loads_started: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub loads_active: usize,
    pub bytes_loaded: u64,

    // === Decoding ===
    pub decodes_completed: u64,
    pub decodes_failed: u64,
    pub previews_delivered: u64,

    // === Computed rates ===
    pub requests_per_second: f64,
    pub bytes_per_second: f64,
    pub avg_decode_ms: f64,
    /// Total time spent in processors
    pub processing_time_ms: f64,
}

impl TelemetrySnapshot {
    /// Formats a byte rate as a human-readable string.
    pub fn throughput_human(&self) -> String {
        let bps = self.bytes_per_second;
        if bps >= 1_000_000.0 {
            format!("{:.1} MB/s", bps / 1_000_000.0)
        } else if bps >= 1_000.0 {
            format!("{:.1} KB/s", bps / 1_000.0)
        } else {
            format!("{:.0} B/s", bps)
        }
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uptime: {:.1}s", self.uptime.as_secs_f64())?;
        writeln!(
            f,
            "Requests: {} submitted, {} completed, {} failed, {} cancelled, {} active",
            self.requests_submitted,
            self.requests_completed,
            self.requests_failed,
            self.requests_cancelled,
            self.requests_active
        )?;
        writeln!(
            f,
            "Memory cache: {} hits, {} misses ({:.1}% hit rate)",
            self.memory_cache_hits,
            self.memory_cache_misses,
            self.memory_cache_hit_rate * 100.0
        )?;
        writeln!(
            f,
            "Load tasks: {} created, {} coalesced; decode tasks: {} created, {} coalesced",
            self.load_tasks_created,
            self.load_tasks_coalesced,
            self.decode_tasks_created,
            self.decode_tasks_coalesced
        )?;
        writeln!(
            f,
            "Loads: {} started, {} completed, {} failed, {} bytes ({})",
            self.loads_started,
            self.loads_completed,
            self.loads_failed,
            self.bytes_loaded,
            self.throughput_human()
        )?;
        write!(
            f,
            "Decodes: {} completed, {} failed, {:.2}ms avg; {:.1} requests/s",
            self.decodes_completed,
            self.decodes_failed,
            self.avg_decode_ms,
            self.requests_per_second
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_human() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.bytes_per_second = 2_500_000.0;
        assert_eq!(snapshot.throughput_human(), "2.5 MB/s");
        snapshot.bytes_per_second = 1_500.0;
        assert_eq!(snapshot.throughput_human(), "1.5 KB/s");
        snapshot.bytes_per_second = 12.0;
        assert_eq!(snapshot.throughput_human(), "12 B/s");
    }

    #[test]
    fn test_display_mentions_counts() {
        let snapshot = TelemetrySnapshot {
            requests_submitted: 7,
            load_tasks_coalesced: 3,
            ..Default::default()
        };
        let text = snapshot.to_string();
        assert!(text.contains("7 submitted"));
        assert!(text.contains("3 coalesced"));
    }
}
