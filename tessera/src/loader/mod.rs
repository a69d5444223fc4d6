//! Data loading collaborator.
//!
//! A [`DataLoader`] fetches the raw bytes for an [`ImageSource`] and streams
//! them back through [`DataCallbacks`]. The pipeline calls `load` at most
//! once per load key at a time and keeps the returned [`LoadHandle`] to
//! cancel or reprioritise the transfer.
//!
//! # Callback contract
//!
//! - `on_data` may be called any number of times, each time with the next
//!   chunk and the expected total length if known.
//! - `on_completion` is called at most once, after the last `on_data`.
//! - After [`LoadHandle::cancel`], the loader may stop calling back at all.
//! - Callbacks may arrive on any thread.

mod http;

pub use http::HttpDataLoader;

use bytes::Bytes;

use crate::error::TransportError;
use crate::request::ImageSource;
use crate::task::Priority;

/// Called with each chunk and the expected total length, if known.
pub type DataHandler = Box<dyn FnMut(Bytes, Option<u64>) + Send>;

/// Called once when the transfer ends.
pub type CompletionHandler = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Callbacks a loader reports progress through.
pub struct DataCallbacks {
    pub on_data: DataHandler,
    pub on_completion: CompletionHandler,
}

impl DataCallbacks {
    pub fn new(
        on_data: impl FnMut(Bytes, Option<u64>) + Send + 'static,
        on_completion: impl FnOnce(Result<(), TransportError>) + Send + 'static,
    ) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_completion: Box::new(on_completion),
        }
    }
}

impl std::fmt::Debug for DataCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataCallbacks")
    }
}

/// Control handle for one in-flight transfer.
pub trait LoadHandle: Send + Sync {
    /// Stops the transfer. Idempotent.
    fn cancel(&self);

    /// Changes the transfer priority. Best-effort.
    fn set_priority(&self, priority: Priority);
}

/// Fetches raw bytes for an image source.
pub trait DataLoader: Send + Sync {
    /// Starts loading `source` and returns a handle to control the transfer.
    fn load(
        &self,
        source: &ImageSource,
        priority: Priority,
        callbacks: DataCallbacks,
    ) -> Box<dyn LoadHandle>;
}
