//! Thread activity registry.
//!
//! Threads that run package code register here and mark themselves busy for
//! the duration of each unit of work: reactor threads while polling a
//! dispatched handler (through [`MonitoredFuture`]), worker threads while
//! running a pool task. Each busy period carries a stack of activity frames,
//! which stands in for a call-stack snapshot when a thread is reported as
//! blocked.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Activity {
    busy_since: Option<Instant>,
    frames: Vec<String>,
}

/// A registered thread.
#[derive(Debug)]
pub struct ThreadEntry {
    id: u64,
    name: String,
    activity: Mutex<Activity>,
}

impl ThreadEntry {
    /// Registry-assigned thread number.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread name at registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long the thread has been inside its outermost frame, if busy.
    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        self.activity
            .lock()
            .busy_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Current frames, outermost first.
    pub fn frames(&self) -> Vec<String> {
        self.activity.lock().frames.clone()
    }

    fn push(&self, label: String) {
        let mut activity = self.activity.lock();
        if activity.frames.is_empty() {
            activity.busy_since = Some(Instant::now());
        }
        activity.frames.push(label);
    }

    fn pop(&self) {
        let mut activity = self.activity.lock();
        activity.frames.pop();
        if activity.frames.is_empty() {
            activity.busy_since = None;
        }
    }
}

/// Registry of threads that execute package code.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<ThreadEntry>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread, returning its entry. Idempotent.
    pub fn register_current(&self) -> Arc<ThreadEntry> {
        let current = thread::current();
        self.threads
            .entry(current.id())
            .or_insert_with(|| {
                Arc::new(ThreadEntry {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                    name: current.name().unwrap_or("<unnamed>").to_string(),
                    activity: Mutex::new(Activity::default()),
                })
            })
            .clone()
    }

    /// Forget the calling thread.
    pub fn deregister_current(&self) {
        self.threads.remove(&thread::current().id());
    }

    /// Mark the calling thread busy with `label` until the guard drops.
    pub fn enter(&self, label: impl Into<String>) -> ActivityGuard {
        let entry = self.register_current();
        entry.push(label.into());
        ActivityGuard { entry }
    }

    /// All registered threads.
    pub fn entries(&self) -> Vec<Arc<ThreadEntry>> {
        let mut entries: Vec<_> = self.threads.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Keeps one activity frame open on the thread that created it.
#[must_use = "the frame closes when the guard drops"]
pub struct ActivityGuard {
    entry: Arc<ThreadEntry>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.entry.pop();
    }
}

/// A future whose every poll is recorded as a busy frame on the polling thread.
///
/// Time spent suspended between polls does not count, so only code that
/// holds a thread without yielding shows up as blocked.
pub struct MonitoredFuture<F> {
    registry: Arc<ThreadRegistry>,
    label: String,
    inner: Pin<Box<F>>,
}

impl<F: Future> MonitoredFuture<F> {
    /// Wrap `inner`, labelling its polls with `label`.
    pub fn new(registry: Arc<ThreadRegistry>, label: impl Into<String>, inner: F) -> Self {
        Self {
            registry,
            label: label.into(),
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for MonitoredFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _frame = this.registry.enter(this.label.clone());
        this.inner.as_mut().poll(cx)
    }
}
