//! HTTP data loader built on reqwest.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{DataCallbacks, DataHandler, DataLoader, LoadHandle};
use crate::error::TransportError;
use crate::request::ImageSource;
use crate::task::Priority;

/// Default request timeout for the HTTP client.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Loads images over HTTP(S) with an async reqwest client.
///
/// Transfers run as tasks on the tokio runtime passed at construction, so
/// `load` can be called from any thread. The response body is streamed
/// chunk by chunk into `on_data`; `on_completion` runs on the blocking
/// pool.
#[derive(Clone)]
pub struct HttpDataLoader {
    client: reqwest::Client,
    runtime: Handle,
}

impl HttpDataLoader {
    /// Creates a loader with the default timeout.
    pub fn new(runtime: Handle) -> Result<Self, TransportError> {
        Self::with_timeout(runtime, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    /// Creates a loader with a custom request timeout.
    pub fn with_timeout(runtime: Handle, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(runtime, client))
    }

    /// Wraps an existing client.
    pub fn with_client(runtime: Handle, client: reqwest::Client) -> Self {
        Self { client, runtime }
    }
}

impl std::fmt::Debug for HttpDataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDataLoader").finish_non_exhaustive()
    }
}

async fn fetch(
    client: &reqwest::Client,
    url: &str,
    on_data: &mut DataHandler,
) -> Result<(), TransportError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| TransportError::Network(format!("Request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let total = response.content_length();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| TransportError::Network(format!("Failed to read response: {}", e)))?
    {
        trace!(url, len = chunk.len(), "Received chunk");
        on_data(chunk, total);
    }
    Ok(())
}

impl DataLoader for HttpDataLoader {
    fn load(
        &self,
        source: &ImageSource,
        priority: Priority,
        callbacks: DataCallbacks,
    ) -> Box<dyn LoadHandle> {
        let token = CancellationToken::new();
        let handle = HttpLoadHandle {
            token: token.clone(),
            priority: Arc::new(AtomicI32::new(priority.value())),
        };

        let client = self.client.clone();
        let url = source.as_str().to_string();
        let DataCallbacks {
            mut on_data,
            on_completion,
        } = callbacks;

        debug!(url = %url, priority = %priority, "Starting HTTP load");
        self.runtime.spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(TransportError::Cancelled),
                result = fetch(&client, &url, &mut on_data) => result,
            };
            if let Err(ref e) = result {
                if *e != TransportError::Cancelled {
                    warn!(url = %url, error = %e, "HTTP load failed");
                }
            }
            // Completion drives decoding and processing; keep it off the async workers.
            tokio::task::spawn_blocking(move || on_completion(result));
        });

        Box::new(handle)
    }
}

struct HttpLoadHandle {
    token: CancellationToken,
    priority: Arc<AtomicI32>,
}

impl LoadHandle for HttpLoadHandle {
    fn cancel(&self) {
        self.token.cancel();
    }

    // reqwest has no per-request priority; the value is kept for tracing.
    fn set_priority(&self, priority: Priority) {
        let old = self.priority.swap(priority.value(), Ordering::Relaxed);
        trace!(old, new = priority.value(), "HTTP load priority changed");
    }
}
