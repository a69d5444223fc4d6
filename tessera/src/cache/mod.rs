//! Memory caching of finished images.
//!
//! - [`MemoryCache`] - generic cost-bounded LRU store
//! - [`ImageCaching`] - the interface the pipeline uses for its image cache
//! - [`CacheStats`] - hit/miss/eviction counters

mod memory;
mod traits;

pub use memory::MemoryCache;
pub use traits::ImageCaching;

use std::fmt;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub total_cost: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} bytes, {:.1}% hit rate, {} evictions",
            self.entry_count,
            self.total_cost,
            self.hit_rate() * 100.0,
            self.evictions
        )
    }
}
