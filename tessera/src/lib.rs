//! Tessera - a deduplicating, priority-aware image loading pipeline.
//!
//! Many concurrent, overlapping requests for decoded and processed images
//! are turned into the minimal set of actual work: one transfer per source,
//! one decode per decode key, one processing run per cache key. Every caller
//! keeps independent control over priority, cancellation and progress of the
//! work it shares with others.
//!
//! # Modules
//!
//! - [`task`] - multicast, cancellable tasks and the deduplicating [`TaskPool`]
//! - [`rate_limiter`] - token bucket gating new transfers
//! - [`cache`] - cost-bounded LRU memory cache
//! - [`pipeline`] - the load, decode, process and cache stages
//! - [`preheat`] - reference-counted cache warming
//! - [`loader`], [`decoder`], [`processing`] - pluggable collaborators
//! - [`telemetry`], [`logging`], [`config`] - ambient infrastructure

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod image;
pub mod loader;
pub mod logging;
pub mod pipeline;
pub mod preheat;
pub mod processing;
pub mod rate_limiter;
pub mod request;
pub mod task;
pub mod telemetry;

pub use self::cache::{ImageCaching, MemoryCache};
pub use self::config::PipelineConfig;
pub use self::error::{PipelineError, TransportError};
pub use self::image::{CacheType, ImageContainer, ImageResponse};
pub use self::pipeline::{ImageEvent, ImageTask, Pipeline, PipelineBuilder};
pub use self::preheat::Preheater;
pub use self::request::{ImageRequest, ImageSource};
pub use self::task::{Priority, Task, TaskPool};

/// Version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
