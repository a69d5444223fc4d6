//! Load stage: fetches the bytes for one source through the data loader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::LoadedData;
use crate::error::{PipelineError, TransportError};
use crate::loader::{DataCallbacks, LoadHandle};
use crate::pipeline::PipelineInner;
use crate::request::ImageSource;
use crate::task::{Producer, Task, TaskProgress};
use crate::telemetry::PipelineMetrics;

pub(super) type LoadTask = Task<LoadedData, PipelineError>;

/// Creates the (idle) load task for `source`.
///
/// When started, the transfer is admitted through the rate limiter if it is
/// enabled. A task cancelled while waiting for a token never reaches the
/// loader and gives its token back.
pub(super) fn make_load_task(pipeline: Weak<PipelineInner>, source: ImageSource) -> LoadTask {
    Task::new(move |producer| {
        let Some(inner) = pipeline.upgrade() else {
            producer.send_error(PipelineError::Cancelled);
            return;
        };

        if inner.config.rate_limiter_enabled {
            let limiter = Arc::clone(&inner.rate_limiter);
            drop(inner);
            limiter.execute(move || start_load(&pipeline, &source, &producer));
        } else {
            drop(inner);
            start_load(&pipeline, &source, &producer);
        }
    })
}

/// Hands the transfer to the data loader. Returns false if nothing was started.
fn start_load(
    pipeline: &Weak<PipelineInner>,
    source: &ImageSource,
    producer: &Producer<LoadedData, PipelineError>,
) -> bool {
    if producer.is_cancelled() {
        trace!(%source, "Load cancelled before start");
        return false;
    }
    let Some(inner) = pipeline.upgrade() else {
        producer.send_error(PipelineError::Cancelled);
        return false;
    };

    inner.metrics.load_started();
    debug!(%source, priority = %producer.priority(), "Starting load");

    let tracker = Arc::new(LoadTracker::new(Arc::clone(&inner.metrics)));
    let buffer = Arc::new(Mutex::new(BytesMut::new()));
    let progressive = inner.config.progressive_decoding_enabled;

    let on_data = {
        let buffer = Arc::clone(&buffer);
        let metrics = Arc::clone(&inner.metrics);
        let producer = producer.clone();
        move |chunk: Bytes, total: Option<u64>| {
            metrics.bytes_received(chunk.len() as u64);
            let (received, partial) = {
                let mut buffer = buffer.lock();
                buffer.extend_from_slice(&chunk);
                let partial = progressive.then(|| Bytes::copy_from_slice(&buffer));
                (buffer.len() as u64, partial)
            };
            producer.send_progress(TaskProgress::new(received, total.unwrap_or(0)));
            if let Some(data) = partial {
                producer.send_value(
                    LoadedData {
                        data,
                        is_final: false,
                    },
                    false,
                );
            }
        }
    };

    let on_completion = {
        let tracker = Arc::clone(&tracker);
        let producer = producer.clone();
        let source = source.clone();
        move |result: Result<(), TransportError>| match result {
            Ok(()) => {
                let data = std::mem::take(&mut *buffer.lock()).freeze();
                tracker.finish(true);
                debug!(%source, bytes = data.len(), "Load completed");
                producer.send_value(
                    LoadedData {
                        data,
                        is_final: true,
                    },
                    true,
                );
            }
            Err(e) => {
                tracker.finish(false);
                debug!(%source, error = %e, "Load failed");
                producer.send_error(PipelineError::Transport(e));
            }
        }
    };

    let handle: Arc<dyn LoadHandle> = Arc::from(inner.loader.load(
        source,
        producer.priority(),
        DataCallbacks::new(on_data, on_completion),
    ));

    let cancel_handle = Arc::clone(&handle);
    producer.on_cancel(move || {
        cancel_handle.cancel();
        tracker.finish(false);
    });
    producer.on_priority_change(move |priority| handle.set_priority(priority));
    true
}

/// Records exactly one terminal load metric per started transfer.
struct LoadTracker {
    metrics: Arc<PipelineMetrics>,
    finished: AtomicBool,
}

impl LoadTracker {
    fn new(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            metrics,
            finished: AtomicBool::new(false),
        }
    }

    fn finish(&self, success: bool) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if success {
            self.metrics.load_completed();
        } else {
            self.metrics.load_failed();
        }
    }
}
