//! Caller-side handle for one pipeline request.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PipelineError;
use crate::image::{ImageContainer, ImageResponse};
use crate::request::CacheKey;
use crate::task::{Lease, Priority, Subscription, TaskProgress};
use crate::telemetry::PipelineMetrics;

/// Event delivered to a request's callback.
#[derive(Debug, Clone)]
pub enum ImageEvent {
    /// Bytes received so far for the underlying load.
    Progress(TaskProgress),

    /// A partially decoded image (progressive decoding only).
    Preview(ImageResponse),

    /// The request finished. Delivered exactly once, unless the request was
    /// cancelled by its caller, in which case nothing more is delivered.
    Completed(Result<ImageResponse, PipelineError>),
}

pub(crate) type EventSink = Box<dyn FnMut(ImageEvent) + Send>;

type Binding = (
    Subscription<ImageContainer, PipelineError>,
    Lease<CacheKey, ImageContainer, PipelineError>,
);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state of one in-flight request.
pub(crate) struct RequestState {
    id: u64,
    label: Option<String>,
    finished: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    binding: Mutex<Option<Binding>>,
    timer: Mutex<Option<CancellationToken>>,
    metrics: Arc<PipelineMetrics>,
}

impl RequestState {
    pub fn new(label: Option<String>, sink: EventSink, metrics: Arc<PipelineMetrics>) -> Self {
        metrics.request_submitted();
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            label,
            finished: AtomicBool::new(false),
            sink: Mutex::new(Some(sink)),
            binding: Mutex::new(None),
            timer: Mutex::new(None),
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Stores the subscription that feeds this request.
    ///
    /// If the request already finished, the binding is torn down instead.
    pub fn bind(
        &self,
        subscription: Subscription<ImageContainer, PipelineError>,
        lease: Lease<CacheKey, ImageContainer, PipelineError>,
    ) {
        if !subscription.is_active() || self.is_finished() {
            subscription.unsubscribe();
            return;
        }
        *self.binding.lock() = Some((subscription, lease));

        // A cancel racing with the store may have missed the binding.
        if self.is_finished() {
            if let Some((subscription, lease)) = self.binding.lock().take() {
                subscription.unsubscribe();
                drop(lease);
            }
        }
    }

    /// Arms the timeout timer. Ignored once the request finished.
    pub fn set_timer(&self, token: CancellationToken) {
        let mut timer = self.timer.lock();
        if self.is_finished() {
            token.cancel();
            return;
        }
        *timer = Some(token);
    }

    /// Delivers a non-terminal event.
    pub fn emit(&self, event: ImageEvent) {
        if self.is_finished() {
            return;
        }
        let mut sink = self.sink.lock();
        if self.is_finished() {
            return;
        }
        if let Some(sink) = sink.as_mut() {
            sink(event);
        }
    }

    /// Finishes the request with `result` and delivers it.
    pub fn complete(&self, result: Result<ImageResponse, PipelineError>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_timer();
        drop(self.binding.lock().take());

        match &result {
            Ok(_) => self.metrics.request_completed(),
            Err(e) if e.is_cancelled() => self.metrics.request_cancelled(),
            Err(_) => self.metrics.request_failed(),
        }
        debug!(request = self.id, label = ?self.label, ok = result.is_ok(), "Request finished");
        self.deliver(ImageEvent::Completed(result));
    }

    /// Withdraws the caller's interest without notifying the caller.
    pub fn cancel(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_timer();
        self.detach();
        self.metrics.request_cancelled();
        debug!(request = self.id, label = ?self.label, "Request cancelled");
    }

    /// Withdraws interest because the deadline passed and reports a timeout.
    pub fn time_out(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.detach();
        self.metrics.request_failed();
        debug!(request = self.id, label = ?self.label, "Request timed out");
        self.deliver(ImageEvent::Completed(Err(PipelineError::Timeout)));
    }

    pub fn set_priority(&self, priority: Priority) {
        if let Some((subscription, _)) = self.binding.lock().as_ref() {
            subscription.set_priority(priority);
        }
    }

    fn detach(&self) {
        let binding = self.binding.lock().take();
        if let Some((subscription, lease)) = binding {
            subscription.unsubscribe();
            drop(lease);
        }
    }

    fn stop_timer(&self) {
        if let Some(token) = self.timer.lock().take() {
            token.cancel();
        }
    }

    fn deliver(&self, event: ImageEvent) {
        let sink = self.sink.lock().take();
        if let Some(mut sink) = sink {
            sink(event);
        }
    }
}

/// Handle to a request submitted with [`Pipeline::load_image`].
///
/// Cloning the handle does not duplicate the request. Dropping it does not
/// cancel the request; call [`ImageTask::cancel`].
///
/// [`Pipeline::load_image`]: super::Pipeline::load_image
#[derive(Clone)]
pub struct ImageTask {
    state: Arc<RequestState>,
}

impl ImageTask {
    pub(crate) fn new(state: Arc<RequestState>) -> Self {
        Self { state }
    }

    /// Identifier unique within the process.
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    /// Cancels the request. The callback receives no further events.
    ///
    /// The underlying work is cancelled only if no other request shares it.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Changes this request's priority; shared work runs at the highest
    /// priority among the requests that share it.
    pub fn set_priority(&self, priority: Priority) {
        self.state.set_priority(priority);
    }

    /// Returns true once completed, failed, timed out or cancelled.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

impl fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTask")
            .field("id", &self.state.id)
            .field("label", &self.state.label)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Cancels the wrapped request when dropped, unless it already finished.
pub(crate) struct CancelOnDrop(pub ImageTask);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
