//! Shared collaborators for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;

use tessera::config::PipelineConfig;
use tessera::error::{PipelineError, TransportError};
use tessera::image::ImageResponse;
use tessera::loader::{DataCallbacks, DataLoader, LoadHandle};
use tessera::pipeline::{ImageEvent, Pipeline, PipelineBuilder};
use tessera::request::ImageSource;
use tessera::task::Priority;

/// Encodes a solid-colour PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 200])));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub struct MockHandle {
    cancelled: AtomicBool,
    priority: AtomicI32,
    cancels: Arc<AtomicUsize>,
}

impl LoadHandle for MockHandle {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set_priority(&self, priority: Priority) {
        self.priority.store(priority.value(), Ordering::SeqCst);
    }
}

/// A transfer the test completes by hand.
pub struct PendingLoad {
    pub source: String,
    callbacks: DataCallbacks,
    handle: Arc<MockHandle>,
}

impl PendingLoad {
    pub fn is_cancelled(&self) -> bool {
        self.handle.cancelled.load(Ordering::SeqCst)
    }

    pub fn priority(&self) -> Priority {
        Priority::new(self.handle.priority.load(Ordering::SeqCst))
    }
}

/// In-memory data loader.
///
/// In immediate mode every load completes inside `load`; in manual mode
/// loads are parked until the test calls [`MockLoader::finish`] or
/// [`MockLoader::fail`].
pub struct MockLoader {
    manual: bool,
    data: Mutex<HashMap<String, Vec<u8>>>,
    pending: Mutex<Vec<PendingLoad>>,
    started: Mutex<Vec<String>>,
    cancels: Arc<AtomicUsize>,
}

impl MockLoader {
    pub fn immediate() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    pub fn manual() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    fn new(manual: bool) -> Self {
        Self {
            manual,
            data: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn insert(&self, source: &str, bytes: Vec<u8>) {
        self.data.lock().insert(source.to_string(), bytes);
    }

    /// Sources passed to `load`, in call order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn load_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs `f` against the parked transfer for `source`.
    pub fn with_pending<R>(&self, source: &str, f: impl FnOnce(&PendingLoad) -> R) -> Option<R> {
        self.pending
            .lock()
            .iter()
            .find(|load| load.source == source)
            .map(f)
    }

    /// Delivers the registered bytes for `source` in two chunks and
    /// completes the transfer. Returns false if nothing was parked.
    pub fn finish(&self, source: &str) -> bool {
        let Some(load) = self.take_pending(source) else {
            return false;
        };
        let bytes = self.data.lock().get(source).cloned().unwrap_or_default();
        let PendingLoad { mut callbacks, .. } = load;
        deliver(&mut callbacks, bytes);
        (callbacks.on_completion)(Ok(()));
        true
    }

    /// Fails the parked transfer for `source`.
    pub fn fail(&self, source: &str, error: TransportError) -> bool {
        let Some(load) = self.take_pending(source) else {
            return false;
        };
        (load.callbacks.on_completion)(Err(error));
        true
    }

    fn take_pending(&self, source: &str) -> Option<PendingLoad> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|load| load.source == source)?;
        Some(pending.remove(index))
    }
}

fn deliver(callbacks: &mut DataCallbacks, bytes: Vec<u8>) {
    let total = bytes.len() as u64;
    let bytes = Bytes::from(bytes);
    let mid = bytes.len() / 2;
    (callbacks.on_data)(bytes.slice(..mid), Some(total));
    (callbacks.on_data)(bytes.slice(mid..), Some(total));
}

impl DataLoader for MockLoader {
    fn load(
        &self,
        source: &ImageSource,
        priority: Priority,
        callbacks: DataCallbacks,
    ) -> Box<dyn LoadHandle> {
        let key = source.as_str().to_string();
        self.started.lock().push(key.clone());
        let handle = Arc::new(MockHandle {
            cancelled: AtomicBool::new(false),
            priority: AtomicI32::new(priority.value()),
            cancels: Arc::clone(&self.cancels),
        });

        if self.manual {
            self.pending.lock().push(PendingLoad {
                source: key,
                callbacks,
                handle: Arc::clone(&handle),
            });
            return Box::new(SharedHandle(handle));
        }

        let bytes = self.data.lock().get(&key).cloned();
        let mut callbacks = callbacks;
        match bytes {
            Some(bytes) => {
                deliver(&mut callbacks, bytes);
                (callbacks.on_completion)(Ok(()));
            }
            None => (callbacks.on_completion)(Err(TransportError::Status(404))),
        }
        Box::new(SharedHandle(handle))
    }
}

struct SharedHandle(Arc<MockHandle>);

impl LoadHandle for SharedHandle {
    fn cancel(&self) {
        self.0.cancel();
    }

    fn set_priority(&self, priority: Priority) {
        self.0.set_priority(priority);
    }
}

/// Pipeline over `loader` with the rate limiter off, so nothing needs a runtime.
pub fn pipeline(loader: Arc<MockLoader>) -> Pipeline {
    pipeline_with(loader, PipelineConfig::default().with_rate_limiter(false))
}

pub fn pipeline_with(loader: Arc<MockLoader>, config: PipelineConfig) -> Pipeline {
    PipelineBuilder::new(loader).config(config).build()
}

/// Collects the events delivered to a request.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<ImageEvent>>>,
}

impl Recorder {
    pub fn sink(&self) -> impl FnMut(ImageEvent) + Send + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().push(event)
    }

    pub fn events(&self) -> Vec<ImageEvent> {
        self.events.lock().clone()
    }

    /// The completion result, if delivered.
    pub fn completion(&self) -> Option<Result<ImageResponse, PipelineError>> {
        self.events.lock().iter().find_map(|event| match event {
            ImageEvent::Completed(result) => Some(result.clone()),
            _ => None,
        })
    }

    pub fn completion_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ImageEvent::Completed(_)))
            .count()
    }

    pub fn progress_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ImageEvent::Progress(_)))
            .count()
    }
}
