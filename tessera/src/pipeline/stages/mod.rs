//! Pipeline stages.
//!
//! Each stage is a deduplicated [`Task`] created through a [`TaskPool`]:
//!
//! ```text
//! caller ──subscribe──► process task ──► decode task ──► load task ──► DataLoader
//!          (CacheKey)                    (DecodeKey)     (LoadKey)     (rate limited)
//! ```
//!
//! A downstream task's work function acquires its upstream task from the
//! upstream pool and subscribes to it at the downstream task's aggregate
//! priority. The pair (subscription, lease) is kept in an [`Upstream`],
//! which forwards priority changes and unsubscribes when the downstream
//! task is cancelled. The last downstream to leave therefore cancels the
//! upstream task, all the way down to the transfer.
//!
//! [`Task`]: crate::task::Task
//! [`TaskPool`]: crate::task::TaskPool

mod decode;
mod load;
mod process;

pub(crate) use process::make_process_task;

use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::task::{Lease, Priority, Producer, Subscription, Task, TaskEvent, TaskPool};

/// Bytes accumulated by a load task.
#[derive(Debug, Clone)]
pub(crate) struct LoadedData {
    pub data: Bytes,
    pub is_final: bool,
}

type Binding<K, V> = (Subscription<V, PipelineError>, Lease<K, V, PipelineError>);

/// A downstream task's interest in one upstream task.
pub(crate) struct Upstream<K, V>
where
    K: Eq + Hash,
{
    binding: Arc<Mutex<Option<Binding<K, V>>>>,
}

impl<K, V> Clone for Upstream<K, V>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
        }
    }
}

impl<K, V> Upstream<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            binding: Arc::new(Mutex::new(None)),
        }
    }

    /// Joins the upstream task for `key` and subscribes `downstream` to it
    /// through `sink`. Returns the upstream task.
    ///
    /// Cancel and priority hooks are registered on the downstream producer
    /// before subscribing, so a cancellation that races with this call is
    /// never lost.
    pub fn attach<D>(
        &self,
        downstream: &Producer<D, PipelineError>,
        pool: &TaskPool<K, V, PipelineError>,
        key: K,
        make: impl FnMut() -> Task<V, PipelineError>,
        sink: impl FnMut(TaskEvent<V, PipelineError>) + Send + 'static,
    ) -> Task<V, PipelineError>
    where
        D: Clone + Send + 'static,
    {
        let on_cancel = self.clone();
        downstream.on_cancel(move || on_cancel.detach());
        let on_priority = self.clone();
        downstream.on_priority_change(move |priority| on_priority.set_priority(priority));

        let (task, lease, subscription) = pool.join(key, make, downstream.priority(), sink);
        if !subscription.is_active() {
            // The upstream task finished while we were subscribing.
            return task;
        }
        *self.binding.lock() = Some((subscription, lease));

        if downstream.is_cancelled() {
            self.detach();
        } else if task.is_terminal() {
            self.release();
        }
        task
    }

    /// Unsubscribes from the upstream task and releases the lease.
    pub fn detach(&self) {
        let binding = self.binding.lock().take();
        if let Some((subscription, lease)) = binding {
            subscription.unsubscribe();
            drop(lease);
        }
    }

    /// Releases the lease of an upstream task that already finished.
    pub fn release(&self) {
        let binding = self.binding.lock().take();
        drop(binding);
    }

    pub fn set_priority(&self, priority: Priority) {
        if let Some((subscription, _)) = self.binding.lock().as_ref() {
            subscription.set_priority(priority);
        }
    }
}
