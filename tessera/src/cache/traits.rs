//! Image cache interface used by the pipeline.
//!
//! The pipeline talks to its cache only through [`ImageCaching`], so an
//! embedding application can supply its own store. The default
//! implementation is [`MemoryCache<CacheKey, ImageContainer>`], costed by
//! decoded byte size.

use crate::cache::MemoryCache;
use crate::image::ImageContainer;
use crate::request::CacheKey;

/// Store of final, processed images keyed by [`CacheKey`].
///
/// Implementations must be safe to call from any thread and must not call
/// back into the pipeline.
pub trait ImageCaching: Send + Sync {
    /// Returns the cached image, if any.
    fn get(&self, key: &CacheKey) -> Option<ImageContainer>;

    /// Stores an image. Oversized images may be silently dropped.
    fn set(&self, key: CacheKey, image: ImageContainer);

    /// Removes an image.
    fn remove(&self, key: &CacheKey);

    /// Removes every image.
    fn clear(&self);
}

impl ImageCaching for MemoryCache<CacheKey, ImageContainer> {
    fn get(&self, key: &CacheKey) -> Option<ImageContainer> {
        MemoryCache::get(self, key)
    }

    fn set(&self, key: CacheKey, image: ImageContainer) {
        let cost = image.cost();
        MemoryCache::set(self, key, image, cost);
    }

    fn remove(&self, key: &CacheKey) {
        MemoryCache::remove(self, key);
    }

    fn clear(&self) {
        MemoryCache::clear(self);
    }
}
