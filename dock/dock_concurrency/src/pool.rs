//! Bounded worker pool.
//!
//! Package loading does disk I/O and dynamic symbol resolution, so it runs
//! here instead of on a reactor thread. Workers are named
//! `<prefix>-<n>` so thread telemetry can classify them, and report each
//! task to a [`WorkerHooks`] implementation.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dock_core::error::panic_message;
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// Error when submitting a task to the pool
#[derive(Error, Debug)]
pub enum ThreadPoolError {
    /// The pool is shutting down
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The task queue is full
    #[error("worker pool queue is full")]
    QueueFull,

    /// A worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Error when awaiting a submitted task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was discarded before it ran
    #[error("task was dropped before completion")]
    Dropped,
}

/// Observer of worker threads and the tasks they run.
///
/// Every method runs on the worker thread itself.
pub trait WorkerHooks: Send + Sync {
    /// A worker thread started.
    fn on_worker_start(&self, _name: &str) {}

    /// A task labelled `label` is about to run.
    fn on_task_start(&self, _label: &str) {}

    /// The current task finished, normally or by panicking.
    fn on_task_end(&self) {}

    /// The worker thread is exiting.
    fn on_worker_stop(&self) {}
}

struct NoHooks;

impl WorkerHooks for NoHooks {}

/// Statistics about the pool
#[derive(Debug, Default, Clone)]
pub struct ThreadPoolStats {
    /// Number of tasks queued
    pub tasks_queued: usize,

    /// Number of tasks completed
    pub tasks_completed: usize,

    /// Number of tasks that panicked
    pub tasks_panicked: usize,

    /// Total task execution time (microseconds)
    pub total_execution_time_us: u64,

    /// Maximum task execution time (microseconds)
    pub max_execution_time_us: u64,
}

/// Configuration for the pool
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Maximum size of the task queue
    pub queue_size: usize,

    /// Number of worker threads
    pub threads: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            threads: num_cpus::get().min(4),
            thread_name_prefix: "dock-worker".to_string(),
        }
    }
}

struct Task {
    label: String,
    func: Box<dyn FnOnce() + Send + 'static>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
    total_execution_us: AtomicU64,
    max_execution_us: AtomicU64,
}

/// Handle to the result of a submitted task.
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, String>>,
}

impl<R> TaskHandle<R> {
    /// Wait for the task without blocking the calling thread.
    pub async fn join(self) -> Result<R, TaskError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TaskError::Panicked(message)),
            Err(_) => Err(TaskError::Dropped),
        }
    }

    /// Wait for the task, blocking the calling thread. Never call from a reactor thread.
    pub fn blocking_join(self) -> Result<R, TaskError> {
        match self.rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TaskError::Panicked(message)),
            Err(_) => Err(TaskError::Dropped),
        }
    }
}

/// A fixed-size pool of named worker threads fed by a bounded queue.
pub struct ThreadPool {
    sender: Sender<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
    counters: Arc<Counters>,
    config: ThreadPoolConfig,
}

impl ThreadPool {
    /// Create a pool with `threads` workers and default settings otherwise.
    pub fn new(threads: usize) -> Result<Self, ThreadPoolError> {
        Self::with_config(ThreadPoolConfig {
            threads,
            ..Default::default()
        })
    }

    /// Create a pool without hooks.
    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        Self::with_hooks(config, Arc::new(NoHooks))
    }

    /// Create a pool reporting worker activity to `hooks`.
    pub fn with_hooks(
        config: ThreadPoolConfig,
        hooks: Arc<dyn WorkerHooks>,
    ) -> Result<Self, ThreadPoolError> {
        let (sender, receiver) = bounded(config.queue_size);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        info!(
            "Creating worker pool with {} threads and queue size {}",
            config.threads, config.queue_size
        );

        let mut workers = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            let name = format!("{}-{}", config.thread_name_prefix, id);
            let worker = Worker {
                name: name.clone(),
                receiver: receiver.clone(),
                shutting_down: shutting_down.clone(),
                counters: counters.clone(),
                hooks: hooks.clone(),
            };

            let spawned = thread::Builder::new().name(name).spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutting_down.store(true, Ordering::SeqCst);
                    return Err(ThreadPoolError::Spawn(e));
                }
            }
        }

        Ok(Self {
            sender,
            workers: Mutex::new(workers),
            shutting_down,
            counters,
            config,
        })
    }

    /// Queue a fire-and-forget task.
    pub fn execute<F>(&self, label: impl Into<String>, f: F) -> Result<(), ThreadPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ThreadPoolError::ShuttingDown);
        }

        let task = Task {
            label: label.into(),
            func: Box::new(f),
            enqueued_at: Instant::now(),
        };

        match self.sender.try_send(task) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ThreadPoolError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ThreadPoolError::ShuttingDown),
        }
    }

    /// Queue a task and get a handle to its result.
    pub fn submit<F, R>(&self, label: impl Into<String>, f: F) -> Result<TaskHandle<R>, ThreadPoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(label, move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(Ok(value));
            }
            Err(payload) => {
                let _ = tx.send(Err(panic_message(payload.as_ref())));
                // Let the worker account for the panic.
                resume_unwind(payload);
            }
        })?;
        Ok(TaskHandle { rx })
    }

    /// Current statistics.
    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            tasks_queued: self.counters.queued.load(Ordering::Relaxed),
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_panicked: self.counters.panicked.load(Ordering::Relaxed),
            total_execution_time_us: self.counters.total_execution_us.load(Ordering::Relaxed),
            max_execution_time_us: self.counters.max_execution_us.load(Ordering::Relaxed),
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.config.threads
    }

    /// Whether the pool stopped accepting tasks.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks. Workers finish their current task and exit.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Shutting down worker pool");
        }
    }

    /// Shut down and wait for every worker to exit.
    pub fn join(&self) {
        self.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        info!("Worker pool shutdown complete");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        debug!("Worker pool dropped; workers exit at their next poll");
    }
}

struct Worker {
    name: String,
    receiver: Receiver<Task>,
    shutting_down: Arc<AtomicBool>,
    counters: Arc<Counters>,
    hooks: Arc<dyn WorkerHooks>,
}

impl Worker {
    fn run(self) {
        debug!("{}: starting", self.name);
        self.hooks.on_worker_start(&self.name);

        while !self.shutting_down.load(Ordering::SeqCst) {
            let task = match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(task) => task,
                Err(_) => continue,
            };

            trace!(
                "{}: running '{}' after {:.2}ms in queue",
                self.name,
                task.label,
                task.enqueued_at.elapsed().as_micros() as f64 / 1000.0
            );

            self.hooks.on_task_start(&task.label);
            let started = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(task.func));
            let elapsed_us = started.elapsed().as_micros() as u64;
            self.hooks.on_task_end();

            self.counters
                .total_execution_us
                .fetch_add(elapsed_us, Ordering::Relaxed);
            self.counters
                .max_execution_us
                .fetch_max(elapsed_us, Ordering::Relaxed);

            match result {
                Ok(()) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    error!(
                        "{}: task '{}' panicked: {}",
                        self.name,
                        task.label,
                        panic_message(payload.as_ref())
                    );
                    self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Queued tasks are dropped unrun so their handles resolve.
        let mut discarded = 0;
        while let Ok(task) = self.receiver.try_recv() {
            debug!("{}: discarding '{}'", self.name, task.label);
            drop(task);
            discarded += 1;
        }

        self.hooks.on_worker_stop();
        debug!("{}: shutting down, {} queued tasks discarded", self.name, discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_pool_runs_tasks() {
        let pool = ThreadPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let counter = counter.clone();
            pool.execute(format!("task-{}", i), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        wait_for(|| counter.load(Ordering::SeqCst) == 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = ThreadPool::new(1).unwrap();
        let handle = pool
            .submit("compute", || thread::current().name().map(str::to_string))
            .unwrap();
        let name = handle.join().await.unwrap();
        assert_eq!(name.as_deref(), Some("dock-worker-0"));
    }

    #[tokio::test]
    async fn test_submit_reports_panic_and_pool_survives() {
        let pool = ThreadPool::new(1).unwrap();

        let handle = pool.submit("boom", || -> u32 { panic!("exploded") }).unwrap();
        assert_eq!(
            handle.join().await,
            Err(TaskError::Panicked("exploded".to_string()))
        );

        let handle = pool.submit("after", || 7).unwrap();
        assert_eq!(handle.join().await, Ok(7));

        wait_for(|| pool.stats().tasks_completed == 1);
        let stats = pool.stats();
        assert_eq!(stats.tasks_panicked, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_queued_task_dropped_on_shutdown() {
        let pool = ThreadPool::new(1).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        pool.execute("blocker", move || {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_millis(200));
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let queued = pool.submit("queued", || 1).unwrap();
        pool.shutdown();
        assert_eq!(queued.join().await, Err(TaskError::Dropped));
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let pool = ThreadPool::new(2).unwrap();
        pool.join();
        assert!(pool.is_shutting_down());
        assert!(matches!(
            pool.execute("late", || {}),
            Err(ThreadPoolError::ShuttingDown)
        ));
    }

    #[test]
    fn test_queue_full() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            queue_size: 1,
            threads: 1,
            thread_name_prefix: "test".to_string(),
        })
        .unwrap();

        let gate = Arc::new(parking_lot::Mutex::new(()));
        let held = gate.lock();
        let started = Arc::new(AtomicBool::new(false));

        let (g, s) = (gate.clone(), started.clone());
        pool.execute("blocker", move || {
            s.store(true, Ordering::SeqCst);
            let _lock = g.lock();
        })
        .unwrap();
        wait_for(|| started.load(Ordering::SeqCst));

        pool.execute("queued", || {}).unwrap();
        assert!(matches!(
            pool.execute("rejected", || {}),
            Err(ThreadPoolError::QueueFull)
        ));

        drop(held);
    }

    struct Recorder(Mutex<Vec<String>>);

    impl WorkerHooks for Recorder {
        fn on_worker_start(&self, name: &str) {
            self.0.lock().push(format!("start {}", name));
        }

        fn on_task_start(&self, label: &str) {
            self.0.lock().push(format!("task {}", label));
        }

        fn on_task_end(&self) {
            self.0.lock().push("end".to_string());
        }
    }

    #[test]
    fn test_hooks_observe_tasks() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let pool = ThreadPool::with_hooks(
            ThreadPoolConfig {
                threads: 1,
                ..Default::default()
            },
            recorder.clone(),
        )
        .unwrap();

        let handle = pool.submit("deploy repoA", || ()).unwrap();
        handle.blocking_join().unwrap();
        wait_for(|| recorder.0.lock().len() >= 3);

        let events = recorder.0.lock().clone();
        assert_eq!(
            events,
            vec![
                "start dock-worker-0".to_string(),
                "task deploy repoA".to_string(),
                "end".to_string()
            ]
        );
    }
}
