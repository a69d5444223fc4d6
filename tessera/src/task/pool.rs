//! Keyed registry with at-most-one-task-per-key semantics.
//!
//! A [`TaskPool`] deduplicates concurrent requests for the same work key
//! into a single [`Task`]. Every caller that acquires a key receives a
//! [`Lease`]; the entry stays discoverable until either the task finishes
//! or the last lease is released, whichever is observed first.
//!
//! Releasing a lease never cancels the task. Cancellation is driven by the
//! task's own subscriber count.
//!
//! # Example
//!
//! ```
//! use tessera::task::{Task, TaskPool};
//!
//! let pool: TaskPool<&str, u32, String> = TaskPool::new("example");
//! let (task, _lease) = pool.acquire("key", || Task::new(|p| p.send_value(1, true)));
//! let (same, _other) = pool.acquire("key", || unreachable!());
//! assert_eq!(task.id(), same.id());
//! ```

use super::core::{Sink, Subscription, Task, TaskEvent};
use super::priority::Priority;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

struct PoolEntry<V, E> {
    task: Task<V, E>,
    holders: usize,
    generation: u64,
}

struct PoolInner<K, V, E> {
    name: &'static str,
    deduplicate: bool,
    entries: Mutex<HashMap<K, PoolEntry<V, E>>>,
    next_generation: AtomicU64,
    created: AtomicU64,
}

impl<K, V, E> PoolInner<K, V, E>
where
    K: Eq + Hash,
{
    /// Removes the entry for `key` if it is still the given generation.
    fn remove_generation(&self, key: &K, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    fn release(&self, key: &K, generation: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            entries.remove(key);
            trace!(pool = self.name, "Pool entry released");
        }
    }
}

/// Deduplicating registry of tasks keyed by work key.
///
/// Cheap to clone; clones share the same registry.
pub struct TaskPool<K, V, E> {
    inner: Arc<PoolInner<K, V, E>>,
}

impl<K, V, E> Clone for TaskPool<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for TaskPool<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.inner.name)
            .field("deduplicate", &self.inner.deduplicate)
            .field("entries", &self.inner.entries.lock().len())
            .finish()
    }
}

impl<K, V, E> TaskPool<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a deduplicating pool.
    pub fn new(name: &'static str) -> Self {
        Self::with_deduplication(name, true)
    }

    /// Creates a pool; with `deduplicate == false` every acquire makes a
    /// fresh, unregistered task.
    pub fn with_deduplication(name: &'static str, deduplicate: bool) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                deduplicate,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the pool name used in logs.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Returns the live task for `key`, creating it with `make` if needed.
    ///
    /// `make` is called only when no unfinished task is registered for the
    /// key. It should construct the task without starting it; the task
    /// starts when first subscribed.
    pub fn acquire(&self, key: K, make: impl FnOnce() -> Task<V, E>) -> (Task<V, E>, Lease<K, V, E>) {
        if !self.inner.deduplicate {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            let task = make();
            let lease = Lease {
                pool: Arc::clone(&self.inner),
                key,
                generation: None,
                task: task.clone(),
                released: false,
            };
            return (task, lease);
        }

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            if !entry.task.is_terminal() {
                entry.holders += 1;
                let task = entry.task.clone();
                let generation = entry.generation;
                drop(entries);
                trace!(pool = self.inner.name, task = %task.id(), "Joined existing task");
                return (task.clone(), self.lease(key, generation, task));
            }
        }

        let task = make();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            PoolEntry {
                task: task.clone(),
                holders: 1,
                generation,
            },
        );
        drop(entries);
        trace!(pool = self.inner.name, task = %task.id(), "Registered new task");

        // Registered after the pool lock is released: the hook runs inline if
        // the task is already terminal.
        let pool = Arc::downgrade(&self.inner);
        let hook_key = key.clone();
        task.on_finish(move |_| {
            if let Some(pool) = pool.upgrade() {
                pool.remove_generation(&hook_key, generation);
            }
        });

        (task.clone(), self.lease(key, generation, task))
    }

    /// Acquires `key` and subscribes to its task in one step.
    ///
    /// A task that a concurrent last unsubscribe cancelled between the
    /// acquire and the subscribe is skipped and the key acquired again, so
    /// the returned subscription is never a replayed cancellation. `make`
    /// may be called more than once.
    pub fn join(
        &self,
        key: K,
        mut make: impl FnMut() -> Task<V, E>,
        priority: Priority,
        sink: impl FnMut(TaskEvent<V, E>) + Send + 'static,
    ) -> (Task<V, E>, Lease<K, V, E>, Subscription<V, E>) {
        let mut sink: Sink<V, E> = Box::new(sink);
        loop {
            let (task, lease) = self.acquire(key.clone(), &mut make);
            match task.try_subscribe(priority, sink) {
                Ok(subscription) => return (task, lease, subscription),
                Err(returned) => {
                    trace!(pool = self.inner.name, task = %task.id(), "Joined task was cancelled, acquiring again");
                    sink = returned;
                }
            }
        }
    }

    fn lease(&self, key: K, generation: u64, task: Task<V, E>) -> Lease<K, V, E> {
        Lease {
            pool: Arc::clone(&self.inner),
            key,
            generation: Some(generation),
            task,
            released: false,
        }
    }

    /// Returns the number of registered entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Returns true if a task is registered for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    /// Returns the registered task for `key`, if any.
    pub fn task(&self, key: &K) -> Option<Task<V, E>> {
        self.inner.entries.lock().get(key).map(|entry| entry.task.clone())
    }

    /// Returns the number of holders of `key`'s entry.
    pub fn holders(&self, key: &K) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.holders)
            .unwrap_or(0)
    }

    /// Returns how many tasks this pool has constructed.
    pub fn created_count(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }
}

/// One holder's claim on a pool entry.
///
/// Released explicitly with [`Lease::release`] or on drop.
pub struct Lease<K, V, E>
where
    K: Eq + Hash,
{
    pool: Arc<PoolInner<K, V, E>>,
    key: K,
    generation: Option<u64>,
    task: Task<V, E>,
    released: bool,
}

impl<K, V, E> Lease<K, V, E>
where
    K: Eq + Hash,
{
    /// The task this lease refers to.
    pub fn task(&self) -> &Task<V, E> {
        &self.task
    }

    /// The key this lease was acquired for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Detaches from the pool entry. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(generation) = self.generation {
            self.pool.release(&self.key, generation);
        }
    }
}

impl<K, V, E> Drop for Lease<K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.release();
    }
}

impl<K, V, E> fmt::Debug for Lease<K, V, E>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.pool.name)
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}
