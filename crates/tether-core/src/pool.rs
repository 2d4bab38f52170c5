//! Capacity-bounded worker pool.
//!
//! The pool caps how many tasks execute at once. Submission applies
//! backpressure: [`WorkerPool::submit`] blocks the calling thread until one of
//! the `capacity` admission slots is free, then hands the task to a worker
//! thread and returns a [`TaskHandle`] immediately.
//!
//! Tasks run on a rayon pool sized to the capacity, so every admitted task
//! has a thread available. The admission count, not the thread count, is the
//! scarce resource.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::pool::WorkerPool;
//!
//! let pool = WorkerPool::new(2)?;
//!
//! let handle = pool.submit(|| 21 * 2)?;
//! assert_eq!(handle.wait(), Ok(42));
//!
//! // Graceful, then forced shutdown; returns a diagnostic if tasks linger.
//! if let Some(diagnostic) = pool.close() {
//!     eprintln!("{diagnostic}");
//! }
//! # Ok::<(), tether_core::PoolError>(())
//! ```
//!
//! # Cancellation
//!
//! [`WorkerPool::shutdown_now`] cancels the pool-wide [`CancellationToken`].
//! Tasks submitted through [`WorkerPool::submit_cancellable`] can poll the
//! token, or register a callback that unblocks them (closing a socket, for
//! instance).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool as RayonThreadPool, ThreadPoolBuilder};

use crate::error::{PoolError, Result, TaskError, panic_message};
use crate::logging::targets;

/// Counter for unique task IDs.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Counter for cancellation callback registrations.
static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolState {
    /// Accepting tasks.
    #[default]
    Running,
    /// No new tasks are admitted; admitted tasks are draining.
    ShuttingDown,
    /// Shut down and every admitted task has finished.
    Terminated,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

type CancelCallback = Box<dyn FnOnce() + Send>;

/// A cancellation token for cooperative task cancellation.
///
/// The token is shared by every task in a pool and is cancelled by
/// [`WorkerPool::shutdown_now`]. Tasks either poll
/// [`is_cancelled`](Self::is_cancelled) or register a callback with
/// [`on_cancel`](Self::on_cancel) that interrupts whatever they block on.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<CancellationState>,
}

struct CancellationState {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<(u64, CancelCallback)>>,
}

/// Identifies a callback registered with [`CancellationToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelRegistration(u64);

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation and run every registered callback.
    ///
    /// Only the first call has an effect.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Run outside the lock so callbacks may touch the token.
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for (id, callback) in callbacks {
            run_cancel_callback(id, callback);
        }
    }

    /// Register a callback to run when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return CancelRegistration(id);
            }
        }
        run_cancel_callback(id, Box::new(callback));
        CancelRegistration(id)
    }

    /// Remove a previously registered callback.
    ///
    /// Returns `true` if the callback was still pending.
    pub fn remove(&self, registration: CancelRegistration) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != registration.0);
        callbacks.len() != before
    }

    /// Number of callbacks still waiting for cancellation.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

/// A panicking callback must not skip the others or escape `cancel`.
fn run_cancel_callback(id: u64, callback: CancelCallback) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::debug!(
            target: targets::POOL,
            registration = id,
            panic = %panic_message(&*payload),
            "cancel callback panicked"
        );
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("pending_callbacks", &self.pending_callbacks())
            .finish()
    }
}

/// A handle to a submitted task that allows waiting for its result.
///
/// A task that panics reports [`TaskError::Panicked`] here and nowhere else.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    receiver: Receiver<std::result::Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Get the unique task ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the task has completed and its result is waiting.
    ///
    /// Reports `false` again once [`try_get`](Self::try_get) or
    /// [`wait_timeout`](Self::wait_timeout) has taken the result.
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Try to get the result without blocking.
    ///
    /// Returns `None` while the task is still running.
    pub fn try_get(&self) -> Option<std::result::Result<T, TaskError>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }

    /// Wait for the task to complete and return its result.
    pub fn wait(self) -> std::result::Result<T, TaskError> {
        self.receiver.recv().unwrap_or(Err(TaskError::Abandoned))
    }

    /// Wait for the task with a timeout.
    ///
    /// Returns `None` if the timeout elapsed before the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<std::result::Result<T, TaskError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TaskError::Abandoned)),
        }
    }
}

/// Grace periods used by [`WorkerPool::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// How long admitted tasks may drain after a graceful shutdown.
    pub grace_period: Duration,
    /// How long to wait after escalating to a forced shutdown.
    pub forced_period: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            forced_period: Duration::from_secs(2),
        }
    }
}

impl ShutdownPolicy {
    /// Create a policy with explicit grace periods.
    pub fn new(grace_period: Duration, forced_period: Duration) -> Self {
        Self {
            grace_period,
            forced_period,
        }
    }
}

/// Configuration for creating a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently executing tasks.
    pub capacity: usize,
    /// Name prefix for worker threads.
    pub thread_name: String,
    /// Stack size for worker threads in bytes.
    pub stack_size: Option<usize>,
    /// Grace periods applied by `close()`.
    pub shutdown: ShutdownPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            thread_name: "tether-worker".to_string(),
            stack_size: None,
            shutdown: ShutdownPolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker thread stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the shutdown grace periods.
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }
}

/// Admission bookkeeping shared with running tasks.
struct Admission {
    state: Mutex<AdmissionState>,
    changed: Condvar,
}

struct AdmissionState {
    in_flight: usize,
    phase: PoolState,
}

impl Admission {
    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.phase == PoolState::ShuttingDown && state.in_flight == 0 {
            state.phase = PoolState::Terminated;
            tracing::debug!(target: targets::POOL, "worker pool terminated");
        }
        self.changed.notify_all();
    }
}

/// Releases an admission slot when the task finishes, panicking or not.
struct AdmissionSlot(Arc<Admission>);

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A worker pool that never runs more than `capacity` tasks at once.
pub struct WorkerPool {
    pool: RayonThreadPool,
    capacity: usize,
    policy: ShutdownPolicy,
    admission: Arc<Admission>,
    cancellation: CancellationToken,
    /// Outcome of the first `close`, replayed by later calls.
    closed: Mutex<Option<Option<String>>>,
}

impl WorkerPool {
    /// Create a pool with the given capacity and default settings.
    ///
    /// A capacity of zero is rejected with [`PoolError::InvalidCapacity`].
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(PoolConfig::with_capacity(capacity))
    }

    /// Create a pool from a full configuration.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        let thread_name = config.thread_name;
        let mut builder = ThreadPoolBuilder::new()
            .num_threads(config.capacity)
            .thread_name(move |index| format!("{thread_name}-{index}"));

        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool = builder
            .build()
            .map_err(|e| PoolError::CreationFailed(e.to_string()))?;

        tracing::debug!(target: targets::POOL, capacity = config.capacity, "worker pool created");

        Ok(Self {
            pool,
            capacity: config.capacity,
            policy: config.shutdown,
            admission: Arc::new(Admission {
                state: Mutex::new(AdmissionState {
                    in_flight: 0,
                    phase: PoolState::Running,
                }),
                changed: Condvar::new(),
            }),
            cancellation: CancellationToken::new(),
            closed: Mutex::new(None),
        })
    }

    /// Maximum number of concurrently executing tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted tasks that have not finished yet.
    pub fn active_tasks(&self) -> usize {
        self.admission.state.lock().in_flight
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.admission.state.lock().phase
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.state() != PoolState::Running
    }

    /// Whether shutdown has completed.
    pub fn is_terminated(&self) -> bool {
        self.state() == PoolState::Terminated
    }

    /// The pool-wide cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Submit a task, blocking until an admission slot is free.
    ///
    /// Fails fast with [`PoolError::Rejected`] once shutdown has begun, even
    /// for a caller already blocked waiting for a slot.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.admit()?;
        Ok(self.dispatch(task))
    }

    /// Submit a task that receives the pool-wide cancellation token.
    pub fn submit_cancellable<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let token = self.cancellation.clone();
        self.submit(move || task(&token))
    }

    /// Stop admitting tasks; admitted tasks run to completion.
    pub fn shutdown(&self) {
        let mut state = self.admission.state.lock();
        if state.phase != PoolState::Running {
            return;
        }
        state.phase = if state.in_flight == 0 {
            PoolState::Terminated
        } else {
            PoolState::ShuttingDown
        };
        tracing::debug!(
            target: targets::POOL,
            in_flight = state.in_flight,
            state = %state.phase,
            "worker pool shutdown requested"
        );
        // Wake submitters blocked on a full pool so they reject.
        self.admission.changed.notify_all();
    }

    /// Stop admitting tasks and request cancellation of running ones.
    pub fn shutdown_now(&self) {
        self.shutdown();
        if !self.cancellation.is_cancelled() {
            tracing::debug!(target: targets::POOL, "cancelling in-flight tasks");
            self.cancellation.cancel();
        }
    }

    /// Block until every task has finished after shutdown, or the timeout
    /// elapses. Returns whether the pool terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.admission.state.lock();
        while state.phase != PoolState::Terminated {
            if self
                .admission
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.phase == PoolState::Terminated;
            }
        }
        true
    }

    /// Shut down gracefully, escalating to a forced shutdown when tasks do
    /// not drain within the grace period.
    ///
    /// Returns a diagnostic when termination still did not complete. Only the
    /// first call waits; later calls return its outcome immediately.
    pub fn close(&self) -> Option<String> {
        let mut closed = self.closed.lock();
        if let Some(outcome) = closed.as_ref() {
            return outcome.clone();
        }
        let outcome = self.close_once();
        *closed = Some(outcome.clone());
        outcome
    }

    fn close_once(&self) -> Option<String> {
        self.shutdown();
        if self.await_termination(self.policy.grace_period) {
            return None;
        }

        tracing::debug!(
            target: targets::POOL,
            grace_ms = self.policy.grace_period.as_millis() as u64,
            "tasks still running after grace period, forcing shutdown"
        );
        self.shutdown_now();
        if self.await_termination(self.policy.forced_period) {
            return None;
        }

        let remaining = self.active_tasks();
        tracing::warn!(target: targets::POOL, remaining, "worker pool did not terminate");
        Some(format!(
            "Worker pool did not terminate: {remaining} task(s) still running after forced shutdown"
        ))
    }

    fn admit(&self) -> Result<()> {
        let mut state = self.admission.state.lock();
        loop {
            if state.phase != PoolState::Running {
                return Err(PoolError::Rejected);
            }
            if state.in_flight < self.capacity {
                state.in_flight += 1;
                return Ok(());
            }
            self.admission.changed.wait(&mut state);
        }
    }

    fn dispatch<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(1);
        let slot = AdmissionSlot(self.admission.clone());

        self.pool.spawn(move || {
            tracing::trace!(target: targets::POOL, task = id, "task started");
            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| TaskError::Panicked(panic_message(&*payload)));
            if let Err(ref err) = outcome {
                tracing::debug!(target: targets::POOL, task = id, error = %err, "task failed");
            }
            // Free the slot before publishing, so a waiter sees it released.
            drop(slot);
            let _ = sender.send(outcome);
        });

        TaskHandle { id, receiver }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Don't block in drop - just stop admissions
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("active_tasks", &self.active_tasks())
            .field("state", &self.state())
            .finish()
    }
}

static_assertions::assert_impl_all!(WorkerPool: Send, Sync);
static_assertions::assert_impl_all!(CancellationToken: Send, Sync);
