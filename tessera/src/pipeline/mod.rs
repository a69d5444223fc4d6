//! The image pipeline.
//!
//! A [`Pipeline`] turns [`ImageRequest`]s into decoded, processed images while
//! doing the minimum amount of actual work:
//!
//! 1. The memory cache is checked synchronously; a hit completes the request
//!    before [`Pipeline::load_image`] returns.
//! 2. On a miss the request joins (or creates) the task producing its cache
//!    key. That task joins the decode task for the decode key, which joins
//!    the load task for the source. Requests that differ only in processing
//!    share one load and one decode.
//! 3. New loads are admitted through the [`RateLimiter`].
//! 4. Final images are written to the memory cache and delivered.
//!
//! Every stage runs at the highest priority among the requests that still
//! want it, and is cancelled when the last of them goes away.
//!
//! # Example
//!
//! ```no_run
//! use tessera::config::PipelineConfig;
//! use tessera::pipeline::Pipeline;
//! use tessera::request::ImageRequest;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Handle::current();
//! let pipeline = Pipeline::with_http(runtime, PipelineConfig::default())?;
//! let response = pipeline.image(ImageRequest::new("https://example.com/a.png")).await?;
//! println!("{}x{}", response.image().width(), response.image().height());
//! # Ok(())
//! # }
//! ```

mod builder;
mod image_task;
mod stages;

pub use builder::PipelineBuilder;
pub use image_task::{ImageEvent, ImageTask};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::image_task::{CancelOnDrop, RequestState};
use self::stages::{make_process_task, LoadedData};
use crate::cache::ImageCaching;
use crate::config::PipelineConfig;
use crate::decoder::ImageDecoder;
use crate::error::{PipelineError, TransportError};
use crate::image::{CacheType, ImageContainer, ImageResponse};
use crate::loader::{DataLoader, HttpDataLoader};
use crate::rate_limiter::RateLimiter;
use crate::request::{CacheKey, DecodeKey, ImageRequest, LoadKey};
use crate::task::{TaskEvent, TaskPool};
use crate::telemetry::{PipelineMetrics, TelemetrySnapshot};

/// State shared by the pipeline handle and its stages.
///
/// Stages hold it weakly; once every [`Pipeline`] clone is gone, work that
/// has not started yet fails with [`PipelineError::Cancelled`].
pub(crate) struct PipelineInner {
    pub config: PipelineConfig,
    pub loader: Arc<dyn DataLoader>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub cache: Option<Arc<dyn ImageCaching>>,
    pub load_pool: TaskPool<LoadKey, LoadedData, PipelineError>,
    pub decode_pool: TaskPool<DecodeKey, ImageContainer, PipelineError>,
    pub process_pool: TaskPool<CacheKey, ImageContainer, PipelineError>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<PipelineMetrics>,
    pub runtime: Option<Handle>,
    pub shutdown: CancellationToken,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Loads, decodes, processes and caches images.
///
/// Cheap to clone; clones share caches, task registries and the rate limiter.
/// There is no global instance: create one with [`PipelineBuilder`] and pass
/// it where it is needed.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub(crate) fn from_inner(inner: PipelineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a pipeline fetching over HTTP, with the default decoder and a
    /// memory cache sized from `config`.
    pub fn with_http(runtime: Handle, config: PipelineConfig) -> Result<Self, TransportError> {
        let loader = HttpDataLoader::new(runtime.clone())?;
        Ok(PipelineBuilder::new(Arc::new(loader))
            .config(config)
            .runtime(runtime)
            .build())
    }

    /// Submits a request.
    ///
    /// `on_event` receives progress, previews and exactly one
    /// [`ImageEvent::Completed`], unless the request is cancelled through the
    /// returned handle. On a memory cache hit, `Completed` is delivered
    /// before this returns. Events may arrive on any thread.
    pub fn load_image(
        &self,
        request: ImageRequest,
        on_event: impl FnMut(ImageEvent) + Send + 'static,
    ) -> ImageTask {
        let inner = &self.inner;
        let state = Arc::new(RequestState::new(
            request.label().map(str::to_owned),
            Box::new(on_event),
            Arc::clone(&inner.metrics),
        ));
        let handle = ImageTask::new(Arc::clone(&state));
        let key = request.cache_key();
        let options = request.options();

        if options.cache_read {
            if let Some(cache) = &inner.cache {
                if let Some(container) = cache.get(&key) {
                    inner.metrics.memory_cache_hit();
                    trace!(key = %key, "Memory cache hit");
                    state.complete(Ok(ImageResponse::new(container, Some(CacheType::Memory))));
                    return handle;
                }
                inner.metrics.memory_cache_miss();
            }
        }

        let cache = if options.cache_write {
            inner.cache.clone()
        } else {
            None
        };
        let metrics = Arc::clone(&inner.metrics);
        let sink_state = Arc::clone(&state);
        let cache_key = key.clone();
        let sink = move |event: TaskEvent<ImageContainer, PipelineError>| match event {
            TaskEvent::Progress(progress) => sink_state.emit(ImageEvent::Progress(progress)),
            TaskEvent::Value {
                value,
                is_completed: false,
            } => {
                metrics.preview_delivered();
                sink_state.emit(ImageEvent::Preview(ImageResponse::new(value, None)));
            }
            TaskEvent::Value {
                value,
                is_completed: true,
            } => {
                if let Some(cache) = &cache {
                    cache.set(cache_key.clone(), value.clone());
                }
                sink_state.complete(Ok(ImageResponse::new(value, None)));
            }
            TaskEvent::Error(error) => sink_state.complete(Err(error)),
            // Only replayed to late subscribers, which joining a pool never produces.
            TaskEvent::Cancelled => sink_state.complete(Err(PipelineError::Cancelled)),
        };

        let mut created = false;
        let (task, lease, subscription) = inner.process_pool.join(
            key.clone(),
            || {
                created = true;
                make_process_task(Arc::downgrade(inner), request.clone())
            },
            request.priority(),
            sink,
        );
        debug!(
            request = state.id(),
            key = %key,
            task = %task.id(),
            created,
            priority = %request.priority(),
            "Request submitted"
        );
        state.bind(subscription, lease);

        if let Some(timeout) = request.timeout() {
            self.arm_timeout(&state, timeout);
        }
        handle
    }

    /// Loads an image and waits for the result.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn image(&self, request: ImageRequest) -> Result<ImageResponse, PipelineError> {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let task = self.load_image(request, move |event| {
            if let ImageEvent::Completed(result) = event {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(result);
                }
            }
        });
        let _guard = CancelOnDrop(task);
        rx.await.unwrap_or(Err(PipelineError::Cancelled))
    }

    /// Returns the cached final image for `request`, if any.
    pub fn cached_image(&self, request: &ImageRequest) -> Option<ImageResponse> {
        let cache = self.inner.cache.as_ref()?;
        cache
            .get(&request.cache_key())
            .map(|container| ImageResponse::new(container, Some(CacheType::Memory)))
    }

    /// Removes `request`'s final image from the memory cache.
    pub fn remove_cached_image(&self, request: &ImageRequest) {
        if let Some(cache) = &self.inner.cache {
            cache.remove(&request.cache_key());
        }
    }

    /// Empties the memory cache.
    pub fn remove_all_cached_images(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The limiter gating new loads.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.inner.metrics
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of sources currently being loaded.
    pub fn loads_in_flight(&self) -> usize {
        self.inner.load_pool.len()
    }

    /// Number of decode keys currently being decoded.
    pub fn decodes_in_flight(&self) -> usize {
        self.inner.decode_pool.len()
    }

    /// Stops the rate limiter ticker and pending timeouts.
    ///
    /// Requests already in flight keep running; queued loads are admitted
    /// only by explicit [`RateLimiter::tick`] calls from now on.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Pipeline shutting down");
            self.inner.shutdown.cancel();
        }
    }

    fn arm_timeout(&self, state: &Arc<RequestState>, timeout: Duration) {
        let runtime = match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                warn!(request = state.id(), "No tokio runtime available, request timeout ignored");
                return;
            }
        };

        let token = self.inner.shutdown.child_token();
        state.set_timer(token.clone());
        let state = Arc::downgrade(state);
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(state) = state.upgrade() {
                        state.time_out();
                    }
                }
            }
        });
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.inner.config)
            .field("loads_in_flight", &self.loads_in_flight())
            .field("decodes_in_flight", &self.decodes_in_flight())
            .field("has_cache", &self.inner.cache.is_some())
            .finish()
    }
}
