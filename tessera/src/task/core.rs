//! Multicast, cancellable unit of asynchronous work.
//!
//! A [`Task`] wraps a work function that is invoked once when the task
//! starts. The work function receives a [`Producer`] through which it emits
//! progress, intermediate values and a terminal outcome. Any number of
//! callers observe the task through [`Subscription`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --start()/first subscribe--> Running --send_value(_, true)--> Completed
//!                                           --send_error(_)-------> Failed
//!                                           --last unsubscribe----> Cancelled
//! ```
//!
//! # Locking
//!
//! Each task owns one mutex guarding its state and subscriber set. Sinks and
//! hooks are always invoked with that lock released, so a sink may freely
//! unsubscribe, change its priority or subscribe again.

use super::priority::Priority;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Global counter for task identities.
static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric identity.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, work function not yet invoked.
    Idle,
    /// Work function invoked, no terminal outcome yet.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed,
    /// Last subscriber left before the task finished.
    Cancelled,
}

impl TaskState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a unit of work, typically bytes received out of expected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskProgress {
    /// Units completed so far.
    pub completed: u64,
    /// Total units expected, zero when unknown.
    pub total: u64,
}

impl TaskProgress {
    /// Creates a progress value.
    pub fn new(completed: u64, total: u64) -> Self {
        Self { completed, total }
    }

    /// Completed fraction in `0.0..=1.0`, or `0.0` when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }
}

/// Event delivered to a subscription sink.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskEvent<V, E> {
    /// Progress update.
    Progress(TaskProgress),
    /// A value. `is_completed == true` is terminal.
    Value {
        /// The emitted value.
        value: V,
        /// Whether this is the final value.
        is_completed: bool,
    },
    /// Terminal failure.
    Error(E),
    /// Replayed only to subscribers joining a task that was already cancelled.
    Cancelled,
}

impl<V, E> TaskEvent<V, E> {
    /// Returns true if no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Progress(_) => false,
            Self::Value { is_completed, .. } => *is_completed,
            Self::Error(_) | Self::Cancelled => true,
        }
    }
}

/// Subscriber callback.
pub type Sink<V, E> = Box<dyn FnMut(TaskEvent<V, E>) + Send>;

type Work<V, E> = Box<dyn FnOnce(Producer<V, E>) + Send>;
type PriorityHook = Arc<dyn Fn(Priority) + Send + Sync>;
type CancelHook = Box<dyn FnOnce() + Send>;
type FinishHook = Box<dyn FnOnce(TaskState) + Send>;

enum Outcome<V, E> {
    Completed(V),
    Failed(E),
    Cancelled,
}

impl<V: Clone, E: Clone> Outcome<V, E> {
    fn replay(&self) -> TaskEvent<V, E> {
        match self {
            Self::Completed(value) => TaskEvent::Value {
                value: value.clone(),
                is_completed: true,
            },
            Self::Failed(error) => TaskEvent::Error(error.clone()),
            Self::Cancelled => TaskEvent::Cancelled,
        }
    }
}

/// One subscriber's slot in a task's subscriber set.
struct Slot<V, E> {
    active: AtomicBool,
    priority: AtomicI32,
    sink: Mutex<Sink<V, E>>,
}

impl<V, E> Slot<V, E> {
    fn priority(&self) -> Priority {
        Priority(self.priority.load(Ordering::Acquire))
    }

    fn deliver(&self, event: TaskEvent<V, E>) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let mut sink = self.sink.lock();
        if self.active.load(Ordering::Acquire) {
            (sink)(event);
        }
    }
}

struct Inner<V, E> {
    state: TaskState,
    work: Option<Work<V, E>>,
    slots: BTreeMap<u64, Arc<Slot<V, E>>>,
    next_slot: u64,
    priority: Priority,
    outcome: Option<Outcome<V, E>>,
    on_cancel: Vec<CancelHook>,
    on_priority: Option<PriorityHook>,
    on_finish: Vec<FinishHook>,
}

impl<V, E> Inner<V, E> {
    /// Recomputes the aggregate priority; returns the hook to notify on change.
    fn refresh_priority(&mut self) -> Option<(Priority, PriorityHook)> {
        let aggregate = self
            .slots
            .values()
            .map(|slot| slot.priority())
            .max()
            .unwrap_or(Priority::BASELINE);
        if aggregate == self.priority {
            return None;
        }
        self.priority = aggregate;
        self.on_priority.clone().map(|hook| (aggregate, hook))
    }

    /// Moves to a terminal state and detaches everything the task owned.
    fn finish(&mut self, state: TaskState, outcome: Outcome<V, E>) -> Finished<V, E> {
        self.state = state;
        self.outcome = Some(outcome);
        self.priority = Priority::BASELINE;
        self.work = None;
        self.on_priority = None;
        let slots = std::mem::take(&mut self.slots).into_values().collect();
        Finished {
            slots,
            on_cancel: std::mem::take(&mut self.on_cancel),
            on_finish: std::mem::take(&mut self.on_finish),
        }
    }
}

struct Finished<V, E> {
    slots: Vec<Arc<Slot<V, E>>>,
    on_cancel: Vec<CancelHook>,
    on_finish: Vec<FinishHook>,
}

struct TaskInner<V, E> {
    id: TaskId,
    inner: Mutex<Inner<V, E>>,
}

impl<V, E> Drop for TaskInner<V, E> {
    fn drop(&mut self) {
        // Nobody can observe this task any more; stop whatever it started.
        let inner = self.inner.get_mut();
        if inner.state == TaskState::Running {
            inner.state = TaskState::Cancelled;
            for hook in std::mem::take(&mut inner.on_cancel) {
                hook();
            }
        }
    }
}

/// A cancellable, multicast unit of asynchronous work.
///
/// `Task` is a cheap-to-clone handle. Cloning never duplicates the work.
pub struct Task<V, E> {
    inner: Arc<TaskInner<V, E>>,
}

impl<V, E> Clone for Task<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> fmt::Debug for Task<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.inner.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &inner.state)
            .field("priority", &inner.priority)
            .field("subscribers", &inner.slots.len())
            .finish()
    }
}

impl<V, E> Task<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an idle task that runs `work` when started.
    pub fn new(work: impl FnOnce(Producer<V, E>) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                inner: Mutex::new(Inner {
                    state: TaskState::Idle,
                    work: Some(Box::new(work)),
                    slots: BTreeMap::new(),
                    next_slot: 0,
                    priority: Priority::BASELINE,
                    outcome: None,
                    on_cancel: Vec::new(),
                    on_priority: None,
                    on_finish: Vec::new(),
                }),
            }),
        }
    }

    /// Returns the task identity.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.inner.inner.lock().state
    }

    /// Returns true once the task has completed, failed or been cancelled.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns the aggregate priority over active subscriptions.
    pub fn priority(&self) -> Priority {
        self.inner.inner.lock().priority
    }

    /// Returns the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.inner.lock().slots.len()
    }

    /// Returns a producer handle for emitting events.
    pub fn producer(&self) -> Producer<V, E> {
        Producer {
            task: Arc::downgrade(&self.inner),
        }
    }

    /// Invokes the work function. Calling `start` more than once is a no-op.
    pub fn start(&self) {
        let work = {
            let mut inner = self.inner.inner.lock();
            if inner.state != TaskState::Idle {
                return;
            }
            inner.state = TaskState::Running;
            inner.work.take()
        };
        debug!(task = %self.inner.id, "Task started");
        if let Some(work) = work {
            work(self.producer());
        }
    }

    /// Registers a subscriber.
    ///
    /// If the task already reached a terminal state the terminal event is
    /// replayed to `sink` before this returns and the returned subscription
    /// is inactive. An idle task is started after the subscriber has been
    /// registered.
    pub fn subscribe(
        &self,
        priority: Priority,
        sink: impl FnMut(TaskEvent<V, E>) + Send + 'static,
    ) -> Subscription<V, E> {
        match self.try_subscribe(priority, Box::new(sink)) {
            Ok(subscription) => subscription,
            Err(mut sink) => {
                sink(TaskEvent::Cancelled);
                Subscription::inert()
            }
        }
    }

    /// Registers a subscriber unless the task was cancelled.
    ///
    /// Behaves like [`Task::subscribe`], except that a cancelled task hands
    /// `sink` back untouched instead of replaying the cancellation.
    pub fn try_subscribe(
        &self,
        priority: Priority,
        mut sink: Sink<V, E>,
    ) -> Result<Subscription<V, E>, Sink<V, E>> {
        let mut inner = self.inner.inner.lock();

        match inner.outcome.as_ref() {
            Some(Outcome::Cancelled) => return Err(sink),
            Some(outcome) => {
                let event = outcome.replay();
                drop(inner);
                sink(event);
                return Ok(Subscription::inert());
            }
            None => {}
        }

        let id = inner.next_slot;
        inner.next_slot += 1;
        let slot = Arc::new(Slot {
            active: AtomicBool::new(true),
            priority: AtomicI32::new(priority.value()),
            sink: Mutex::new(sink),
        });
        inner.slots.insert(id, Arc::clone(&slot));
        let change = inner.refresh_priority();
        let should_start = inner.state == TaskState::Idle;
        drop(inner);

        trace!(task = %self.inner.id, subscription = id, %priority, "Subscribed");

        if let Some((priority, hook)) = change {
            hook(priority);
        }
        if should_start {
            self.start();
        }

        Ok(Subscription {
            task: Arc::downgrade(&self.inner),
            slot: Arc::downgrade(&slot),
            id,
        })
    }

    /// Runs `hook` once the task reaches a terminal state.
    ///
    /// Runs immediately if the task is already terminal.
    pub fn on_finish(&self, hook: impl FnOnce(TaskState) + Send + 'static) {
        let mut inner = self.inner.inner.lock();
        if inner.state.is_terminal() {
            let state = inner.state;
            drop(inner);
            hook(state);
            return;
        }
        inner.on_finish.push(Box::new(hook));
    }
}

/// Producer-side handle given to a task's work function.
///
/// Holds a weak reference: a producer never keeps its task alive, and
/// emitting into a task that no longer exists is a no-op.
pub struct Producer<V, E> {
    task: Weak<TaskInner<V, E>>,
}

impl<V, E> Clone for Producer<V, E> {
    fn clone(&self) -> Self {
        Self {
            task: Weak::clone(&self.task),
        }
    }
}

impl<V, E> fmt::Debug for Producer<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("alive", &(self.task.strong_count() > 0))
            .finish()
    }
}

impl<V, E> Producer<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Returns the task's current aggregate priority.
    pub fn priority(&self) -> Priority {
        self.task
            .upgrade()
            .map(|task| task.inner.lock().priority)
            .unwrap_or(Priority::BASELINE)
    }

    /// Returns true if the task was cancelled or no longer exists.
    pub fn is_cancelled(&self) -> bool {
        match self.task.upgrade() {
            Some(task) => task.inner.lock().state == TaskState::Cancelled,
            None => true,
        }
    }

    /// Returns the id of the task, if it still exists.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task.upgrade().map(|task| task.id)
    }

    /// Registers a hook run when the task is cancelled.
    ///
    /// Runs immediately if the task was already cancelled; dropped unrun if
    /// the task completes or fails.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let Some(task) = self.task.upgrade() else {
            hook();
            return;
        };
        let mut inner = task.inner.lock();
        match inner.state {
            TaskState::Cancelled => {
                drop(inner);
                hook();
            }
            TaskState::Completed | TaskState::Failed => {}
            _ => inner.on_cancel.push(Box::new(hook)),
        }
    }

    /// Registers the hook notified whenever the aggregate priority changes.
    ///
    /// Replaces any previously registered hook.
    pub fn on_priority_change(&self, hook: impl Fn(Priority) + Send + Sync + 'static) {
        if let Some(task) = self.task.upgrade() {
            let mut inner = task.inner.lock();
            if !inner.state.is_terminal() {
                inner.on_priority = Some(Arc::new(hook));
            }
        }
    }

    /// Emits a progress update to every active subscriber.
    pub fn send_progress(&self, progress: TaskProgress) {
        self.emit(TaskEvent::Progress(progress));
    }

    /// Emits a value; `is_completed == true` finishes the task.
    pub fn send_value(&self, value: V, is_completed: bool) {
        self.emit(TaskEvent::Value {
            value,
            is_completed,
        });
    }

    /// Emits a failure and finishes the task.
    pub fn send_error(&self, error: E) {
        self.emit(TaskEvent::Error(error));
    }

    fn emit(&self, event: TaskEvent<V, E>) {
        let Some(task) = self.task.upgrade() else {
            return;
        };
        let mut inner = task.inner.lock();
        if inner.state.is_terminal() {
            trace!(task = %task.id, state = %inner.state, "Dropping event sent to finished task");
            return;
        }

        let finished = match &event {
            TaskEvent::Value {
                value,
                is_completed: true,
            } => Some(inner.finish(TaskState::Completed, Outcome::Completed(value.clone()))),
            TaskEvent::Error(error) => {
                Some(inner.finish(TaskState::Failed, Outcome::Failed(error.clone())))
            }
            _ => None,
        };

        let Some(finished) = finished else {
            let slots: Vec<_> = inner.slots.values().cloned().collect();
            drop(inner);
            for slot in slots {
                slot.deliver(event.clone());
            }
            return;
        };

        let state = inner.state;
        drop(inner);
        debug!(task = %task.id, %state, subscribers = finished.slots.len(), "Task finished");

        for slot in &finished.slots {
            slot.deliver(event.clone());
            slot.active.store(false, Ordering::Release);
        }
        drop(finished.on_cancel);
        for hook in finished.on_finish {
            hook(state);
        }
    }
}

/// One caller's interest in a task.
///
/// Holds only weak references, so it never extends the task's lifetime.
/// Dropping a subscription does not unsubscribe; call
/// [`Subscription::unsubscribe`] explicitly.
pub struct Subscription<V, E> {
    task: Weak<TaskInner<V, E>>,
    slot: Weak<Slot<V, E>>,
    id: u64,
}

impl<V, E> fmt::Debug for Subscription<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl<V, E> Subscription<V, E> {
    fn inert() -> Self {
        Self {
            task: Weak::new(),
            slot: Weak::new(),
            id: u64::MAX,
        }
    }

    /// Returns true until unsubscribed or the task finishes.
    pub fn is_active(&self) -> bool {
        self.slot
            .upgrade()
            .map(|slot| slot.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Returns this subscription's priority, or `None` when inactive.
    pub fn priority(&self) -> Option<Priority> {
        self.slot
            .upgrade()
            .filter(|slot| slot.active.load(Ordering::Acquire))
            .map(|slot| slot.priority())
    }

    /// Changes this subscriber's priority. No-op when inactive.
    pub fn set_priority(&self, priority: Priority) {
        let (Some(task), Some(slot)) = (self.task.upgrade(), self.slot.upgrade()) else {
            return;
        };
        if !slot.active.load(Ordering::Acquire) {
            return;
        }
        let mut inner = task.inner.lock();
        if !inner.slots.contains_key(&self.id) {
            return;
        }
        slot.priority.store(priority.value(), Ordering::Release);
        let change = inner.refresh_priority();
        drop(inner);
        if let Some((priority, hook)) = change {
            trace!(task = %task.id, %priority, "Task priority changed");
            hook(priority);
        }
    }

    /// Stops receiving events. Idempotent.
    ///
    /// If this was the last active subscription of an unfinished task, the
    /// task is cancelled and its cancel hooks run before this returns.
    pub fn unsubscribe(&self) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        if !slot.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(task) = self.task.upgrade() else {
            return;
        };
        let mut inner = task.inner.lock();
        if inner.slots.remove(&self.id).is_none() {
            return;
        }

        if inner.slots.is_empty() && !inner.state.is_terminal() {
            let finished = inner.finish(TaskState::Cancelled, Outcome::Cancelled);
            drop(inner);
            debug!(task = %task.id, "Task cancelled, last subscriber left");
            for hook in finished.on_cancel {
                hook();
            }
            for hook in finished.on_finish {
                hook(TaskState::Cancelled);
            }
            return;
        }

        let change = inner.refresh_priority();
        drop(inner);
        if let Some((priority, hook)) = change {
            hook(priority);
        }
    }
}
