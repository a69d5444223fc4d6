//! Pipeline construction.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Pipeline, PipelineInner};
use crate::cache::{ImageCaching, MemoryCache};
use crate::config::PipelineConfig;
use crate::decoder::{DefaultImageDecoder, ImageDecoder};
use crate::loader::DataLoader;
use crate::rate_limiter::RateLimiter;
use crate::task::TaskPool;
use crate::telemetry::PipelineMetrics;

enum CacheChoice {
    Default,
    Custom(Arc<dyn ImageCaching>),
    Disabled,
}

/// Builder for [`Pipeline`].
///
/// Only the data loader is required. Unless configured otherwise the
/// pipeline uses [`DefaultImageDecoder`] and a [`MemoryCache`] bounded by
/// [`PipelineConfig::memory_cache`].
///
/// ```
/// use std::sync::Arc;
/// use tessera::config::PipelineConfig;
/// use tessera::loader::HttpDataLoader;
/// use tessera::pipeline::PipelineBuilder;
///
/// let runtime = tokio::runtime::Runtime::new().unwrap();
/// let loader = HttpDataLoader::new(runtime.handle().clone()).unwrap();
/// let pipeline = PipelineBuilder::new(Arc::new(loader))
///     .config(PipelineConfig::default().with_progressive_decoding(true))
///     .runtime(runtime.handle().clone())
///     .build();
/// assert!(pipeline.config().progressive_decoding_enabled);
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    loader: Arc<dyn DataLoader>,
    decoder: Arc<dyn ImageDecoder>,
    cache: CacheChoice,
    runtime: Option<Handle>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl PipelineBuilder {
    pub fn new(loader: Arc<dyn DataLoader>) -> Self {
        Self {
            config: PipelineConfig::default(),
            loader,
            decoder: Arc::new(DefaultImageDecoder),
            cache: CacheChoice::Default,
            runtime: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Uses `cache` instead of the default memory cache.
    pub fn image_cache(mut self, cache: Arc<dyn ImageCaching>) -> Self {
        self.cache = CacheChoice::Custom(cache);
        self
    }

    /// Disables image caching altogether.
    pub fn without_image_cache(mut self) -> Self {
        self.cache = CacheChoice::Disabled;
        self
    }

    /// Runtime for the rate limiter ticker and request timeouts.
    ///
    /// Without one, the current runtime is used if `build` runs inside one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Records into `metrics` instead of a fresh instance.
    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Pipeline {
        let config = self.config;
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let dedup = config.deduplication_enabled;

        let cache: Option<Arc<dyn ImageCaching>> = match self.cache {
            CacheChoice::Default => Some(Arc::new(MemoryCache::new(config.memory_cache.clone()))),
            CacheChoice::Custom(cache) => Some(cache),
            CacheChoice::Disabled => None,
        };

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        let shutdown = CancellationToken::new();
        if config.rate_limiter_enabled {
            match &runtime {
                Some(handle) => {
                    rate_limiter.spawn_ticker(handle, shutdown.child_token());
                }
                None => warn!("No tokio runtime available, rate limiter will only refill on manual ticks"),
            }
        }

        info!(
            deduplication = dedup,
            rate_limiter = config.rate_limiter_enabled,
            starts_per_second = config.rate_limiter.rate_per_second(),
            progressive = config.progressive_decoding_enabled,
            decompression = config.decompression_enabled,
            cache = cache.is_some(),
            "Pipeline created"
        );

        Pipeline::from_inner(PipelineInner {
            loader: self.loader,
            decoder: self.decoder,
            cache,
            load_pool: TaskPool::with_deduplication("load", dedup),
            decode_pool: TaskPool::with_deduplication("decode", dedup),
            process_pool: TaskPool::with_deduplication("process", dedup),
            rate_limiter,
            metrics: self.metrics.unwrap_or_default(),
            runtime,
            shutdown,
            config,
        })
    }
}
