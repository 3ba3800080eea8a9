// Copyright 2022-2023 VMware, Inc.
// SPDX-License-Identifier: BSD-2-Clause

//! Task execution: a [`Client`] submits closures to an [`Executor`] and hands
//! back [`TaskFuture`]s that can be polled, awaited and cancelled.
//!
//! Two executors are provided. [`ThreadPool`] runs jobs on a fixed set of
//! threads fed by a channel. [`SequentialExecutor`] runs queued jobs one at a
//! time on the thread that waits for them, which makes runs deterministic.

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can be canceled, and asked whether it was.
pub trait BasicCanceler: Sync + Send {
    /// Request cancellation.
    fn cancel(&self);

    /// Whether cancellation was requested.
    fn is_canceled(&self) -> bool;
}

/// A shared flag for cooperative cancellation. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BasicCanceler for CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a task produced no value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was canceled before it started
    #[error("task was cancelled")]
    Cancelled,
    /// The task panicked
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The value was already taken out of the future
    #[error("result already taken")]
    Taken,
}

struct TaskState<R> {
    id: usize,
    done: AtomicBool,
    result: Mutex<Option<Result<R, TaskError>>>,
    cancel: CancelToken,
    cancel_requests: AtomicUsize,
}

/// Handle to a submitted task.
pub struct TaskFuture<R> {
    state: Arc<TaskState<R>>,
}

impl<R> Clone for TaskFuture<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.state.id)
            .field("done", &self.done())
            .field("cancel_requests", &self.cancel_requests())
            .finish()
    }
}

impl<R> TaskFuture<R> {
    fn new(id: usize) -> Self {
        TaskFuture {
            state: Arc::new(TaskState {
                id,
                done: AtomicBool::new(false),
                result: Mutex::new(None),
                cancel: CancelToken::new(),
                cancel_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Identifier assigned by the [`Client`], unique per client.
    pub fn id(&self) -> usize {
        self.state.id
    }

    /// Whether the task has finished, one way or another.
    pub fn done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    /// Take the task's value out of the future.
    ///
    /// Returns [`TaskError::Taken`] when called twice, and also when the task
    /// is not done yet; check [`TaskFuture::done`] first.
    pub fn take_result(&self) -> Result<R, TaskError> {
        self.state
            .result
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(TaskError::Taken))
    }

    /// The error the task ended with, if it ended with one.
    pub fn exception(&self) -> Option<TaskError> {
        match &*self.state.result.lock().unwrap() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Ask for the task not to run. A task that already started runs to
    /// completion anyway. Returns `true` if this was the first request.
    pub fn cancel(&self) -> bool {
        self.state.cancel.cancel();
        self.state.cancel_requests.fetch_add(1, Ordering::SeqCst) == 0
    }

    /// How many times [`TaskFuture::cancel`] was called.
    pub fn cancel_requests(&self) -> usize {
        self.state.cancel_requests.load(Ordering::SeqCst)
    }

    fn finish(&self, result: Result<R, TaskError>) {
        *self.state.result.lock().unwrap() = Some(result);
        self.state.done.store(true, Ordering::SeqCst);
    }
}

/// Runs jobs.
pub trait Executor: Send + Sync {
    /// Queue a job for execution.
    fn spawn(&self, job: Job);

    /// Number of jobs that can run at the same time.
    fn num_workers(&self) -> usize;

    /// Run some queued work on the calling thread, if the executor does that.
    /// Returns whether any job was run.
    fn drive(&self) -> bool {
        false
    }
}

/// A fixed-size pool of threads pulling jobs from a shared channel.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Start `num_threads` worker threads (at least one).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let handles = (0..num_threads)
            .map(|_| {
                let receiver = receiver.clone();
                thread::spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
            })
            .collect();
        ThreadPool {
            sender: Some(sender),
            handles,
        }
    }

    /// A pool with one thread per available core.
    pub fn with_available_parallelism() -> Self {
        Self::new(thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

impl Executor for ThreadPool {
    fn spawn(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    log::warn!("worker pool is shut down, dropping job");
                }
            }
            None => log::warn!("worker pool is shut down, dropping job"),
        }
    }

    fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // closing the channel ends the worker loops
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Runs one queued job, in submission order, every time it is driven.
#[derive(Default)]
pub struct SequentialExecutor {
    queue: Mutex<VecDeque<Job>>,
}

impl SequentialExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to run.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Executor for SequentialExecutor {
    fn spawn(&self, job: Job) {
        self.queue.lock().unwrap().push_back(job);
    }

    fn num_workers(&self) -> usize {
        1
    }

    fn drive(&self) -> bool {
        let job = self.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn spawn(&self, job: Job) {
        (**self).spawn(job)
    }

    fn num_workers(&self) -> usize {
        (**self).num_workers()
    }

    fn drive(&self) -> bool {
        (**self).drive()
    }
}

/// Completion notifications: a generation counter bumped on every finished
/// task.
#[derive(Default)]
struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }
}

/// Submits work to an [`Executor`] and waits for it.
pub struct Client {
    executor: Arc<dyn Executor>,
    notifier: Arc<Notifier>,
    next_id: AtomicUsize,
    cancelled: AtomicUsize,
    cancel_requests: AtomicUsize,
}

impl Client {
    pub fn new(executor: impl Executor + 'static) -> Self {
        Client {
            executor: Arc::new(executor),
            notifier: Arc::new(Notifier::default()),
            next_id: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            cancel_requests: AtomicUsize::new(0),
        }
    }

    /// Total number of threads the executor runs jobs on.
    pub fn num_workers(&self) -> usize {
        self.executor.num_workers()
    }

    /// Make `value` available to all workers as one shared read-only copy.
    pub fn scatter<T: ?Sized + Send + Sync>(&self, value: impl Into<Arc<T>>) -> Arc<T> {
        log::debug!("broadcasting shared value to {} workers", self.num_workers());
        value.into()
    }

    /// Submit `f` for execution. The job is skipped, finishing with
    /// [`TaskError::Cancelled`], if the returned future or `run` is canceled
    /// before it starts.
    pub fn submit<R, F>(&self, run: &CancelToken, f: F) -> TaskFuture<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let future = TaskFuture::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = future.clone();
        let notifier = self.notifier.clone();
        let run = run.clone();
        self.executor.spawn(Box::new(move || {
            let result = if handle.state.cancel.is_canceled() || run.is_canceled() {
                Err(TaskError::Cancelled)
            } else {
                panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    TaskError::Panicked(msg)
                })
            };
            handle.finish(result);
            notifier.notify();
        }));
        future
    }

    /// Cancel a future through this client, so that the request is counted.
    pub fn cancel<R>(&self, future: &TaskFuture<R>) {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
        if future.cancel() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of distinct futures canceled through [`Client::cancel`].
    pub fn num_cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Number of calls to [`Client::cancel`], repeats included. Equal to
    /// [`Client::num_cancelled`] when no future was canceled twice.
    pub fn num_cancel_requests(&self) -> usize {
        self.cancel_requests.load(Ordering::SeqCst)
    }

    /// Block until at least one of `futures` is done. Returns immediately if
    /// there are none.
    pub fn wait_first<'a, R: 'a, I>(&self, futures: I)
    where
        I: IntoIterator<Item = &'a TaskFuture<R>> + Clone,
    {
        self.wait_until(|| {
            let mut iter = futures.clone().into_iter().peekable();
            iter.peek().is_none() || iter.any(|f| f.done())
        })
    }

    /// Block until all of `futures` are done.
    pub fn wait_all<'a, R: 'a, I>(&self, futures: I)
    where
        I: IntoIterator<Item = &'a TaskFuture<R>> + Clone,
    {
        self.wait_until(|| futures.clone().into_iter().all(|f| f.done()))
    }

    fn wait_until(&self, ready: impl Fn() -> bool) {
        loop {
            if ready() {
                return;
            }
            // the sequential executor makes progress only here
            if self.executor.drive() {
                continue;
            }
            let mut generation = self.notifier.generation.lock().unwrap();
            // tasks mark themselves done before taking the lock to notify,
            // so checking under the lock cannot miss a wakeup
            while !ready() {
                generation = self.notifier.cond.wait(generation).unwrap();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_runs_jobs() {
        let client = Client::new(ThreadPool::new(3));
        assert_eq!(client.num_workers(), 3);
        let run = CancelToken::new();
        let futures: Vec<_> = (0..10).map(|i| client.submit(&run, move || i * i)).collect();
        client.wait_all(&futures);
        let results: Vec<_> = futures.iter().map(|f| f.take_result().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
        assert_eq!(futures[0].take_result(), Err(TaskError::Taken));
    }

    #[test]
    fn wait_first_returns_before_slow_tasks() {
        let client = Client::new(ThreadPool::new(2));
        let run = CancelToken::new();
        let slow = client.submit(&run, || {
            thread::sleep(Duration::from_millis(500));
            1
        });
        let fast = client.submit(&run, || 2);
        let futures = vec![slow.clone(), fast.clone()];
        client.wait_first(&futures);
        assert!(fast.done());
        assert!(!slow.done());
        client.wait_all(&futures);
        assert_eq!(slow.take_result(), Ok(1));
    }

    #[test]
    fn wait_first_on_nothing_returns() {
        let client = Client::new(SequentialExecutor::new());
        let futures: Vec<TaskFuture<()>> = vec![];
        client.wait_first(&futures);
    }

    #[test]
    fn sequential_runs_one_job_per_wait() {
        let executor = Arc::new(SequentialExecutor::new());
        let client = Client::new(executor.clone());
        let run = CancelToken::new();
        let futures: Vec<_> = (0..3).map(|i| client.submit(&run, move || i)).collect();
        assert_eq!(executor.queued(), 3);
        client.wait_first(&futures);
        assert_eq!(executor.queued(), 2);
        assert!(futures[0].done());
        assert!(!futures[1].done());
    }

    #[test]
    fn cancelled_before_start() {
        let client = Client::new(SequentialExecutor::new());
        let run = CancelToken::new();
        let a = client.submit(&run, || 1);
        let b = client.submit(&run, || 2);
        client.cancel(&a);
        client.cancel(&a);
        assert_eq!(a.cancel_requests(), 2);
        assert_eq!(client.num_cancelled(), 1);
        assert_eq!(client.num_cancel_requests(), 2);
        let futures = vec![a.clone(), b.clone()];
        client.wait_all(&futures);
        assert_eq!(a.take_result(), Err(TaskError::Cancelled));
        assert_eq!(b.take_result(), Ok(2));
    }

    #[test]
    fn run_token_cancels_everything_queued() {
        let client = Client::new(SequentialExecutor::new());
        let run = CancelToken::new();
        let futures: Vec<_> = (0..3).map(|i| client.submit(&run, move || i)).collect();
        run.cancel();
        client.wait_all(&futures);
        assert!(futures
            .iter()
            .all(|f| f.exception() == Some(TaskError::Cancelled)));
    }

    #[test]
    fn panics_are_captured() {
        let client = Client::new(ThreadPool::new(1));
        let run = CancelToken::new();
        let f = client.submit(&run, || -> usize { panic!("boom") });
        client.wait_all([&f]);
        assert_eq!(f.take_result(), Err(TaskError::Panicked("boom".to_string())));
    }
}
