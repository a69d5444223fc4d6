//! Cache warming.
//!
//! A [`Preheater`] issues low-priority pipeline requests for images that
//! will probably be needed soon, such as the rows just past the edge of a
//! scrolling list. Requests are reference counted by cache key: starting
//! the same request twice needs two stops before the underlying work is
//! cancelled. The loaded images are not returned; they land in the memory
//! cache through the pipeline's normal write-through.
//!
//! Because preheat requests go through the same task registries as
//! ordinary requests, a real request for an image that is being preheated
//! joins the in-flight work and raises its priority.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::pipeline::{ImageEvent, ImageTask, Pipeline};
use crate::request::{CacheKey, ImageRequest};
use crate::task::Priority;

struct Entry {
    count: usize,
    task: Option<ImageTask>,
    generation: u64,
}

type Entries = Mutex<HashMap<CacheKey, Entry>>;

/// Reference-counted background loading of images into the cache.
pub struct Preheater {
    pipeline: Pipeline,
    priority: Priority,
    entries: Arc<Entries>,
    next_generation: AtomicU64,
}

impl Preheater {
    /// Creates a preheater issuing requests at [`Priority::LOW`].
    pub fn new(pipeline: Pipeline) -> Self {
        Self::with_priority(pipeline, Priority::LOW)
    }

    pub fn with_priority(pipeline: Pipeline, priority: Priority) -> Self {
        Self {
            pipeline,
            priority,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Priority used for preheat requests.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Starts preheating `requests`, or adds a reference to those already
    /// being preheated.
    pub fn start_preheating(&self, requests: &[ImageRequest]) {
        for request in requests {
            self.start_one(request);
        }
    }

    /// Drops one reference to each of `requests`; cancels those that reach
    /// zero. Requests that are not being preheated are ignored.
    pub fn stop_preheating(&self, requests: &[ImageRequest]) {
        for request in requests {
            self.stop_one(request);
        }
    }

    /// Cancels every preheat request regardless of reference counts.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Stopping all preheating");
        }
        for (_, entry) in drained {
            if let Some(task) = entry.task {
                task.cancel();
            }
        }
    }

    /// Returns true while `request` is being preheated.
    pub fn is_preheating(&self, request: &ImageRequest) -> bool {
        self.entries.lock().contains_key(&request.cache_key())
    }

    /// Number of outstanding starts for `request`.
    pub fn reference_count(&self, request: &ImageRequest) -> usize {
        self.entries
            .lock()
            .get(&request.cache_key())
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    /// Number of distinct requests being preheated.
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn start_one(&self, request: &ImageRequest) {
        let key = request.cache_key();
        let generation = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.count += 1;
                trace!(key = %key, count = entry.count, "Preheat reference added");
                return;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            entries.insert(
                key.clone(),
                Entry {
                    count: 1,
                    task: None,
                    generation,
                },
            );
            generation
        };

        debug!(key = %key, priority = %self.priority, "Preheating");
        let entries: Weak<Entries> = Arc::downgrade(&self.entries);
        let finished_key = key.clone();
        let task = self.pipeline.load_image(
            request.clone().with_priority(self.priority),
            move |event| {
                if let ImageEvent::Completed(result) = event {
                    if let Err(e) = &result {
                        debug!(key = %finished_key, error = %e, "Preheat request failed");
                    }
                    if let Some(entries) = entries.upgrade() {
                        remove_generation(&entries, &finished_key, generation);
                    }
                }
            },
        );

        // The request may already have finished (cache hit) or been stopped.
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) if entry.generation == generation => entry.task = Some(task),
            _ => {
                drop(entries);
                task.cancel();
            }
        }
    }

    fn stop_one(&self, request: &ImageRequest) {
        let key = request.cache_key();
        let task = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            entry.count -= 1;
            if entry.count > 0 {
                trace!(key = %key, count = entry.count, "Preheat reference dropped");
                return;
            }
            entries.remove(&key).and_then(|entry| entry.task)
        };

        debug!(key = %key, "Stopped preheating");
        if let Some(task) = task {
            task.cancel();
        }
    }
}

fn remove_generation(entries: &Entries, key: &CacheKey, generation: u64) {
    let mut entries = entries.lock();
    if entries
        .get(key)
        .is_some_and(|entry| entry.generation == generation)
    {
        entries.remove(key);
    }
}

impl Drop for Preheater {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl fmt::Debug for Preheater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preheater")
            .field("priority", &self.priority)
            .field("active", &self.active_count())
            .finish()
    }
}
