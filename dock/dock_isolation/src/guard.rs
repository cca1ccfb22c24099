//! Unit lifetime guard.
//!
//! `UnitGuard` is an `Arc`-wrapped handle to a mapped unit image. As long as
//! any clone exists the image stays mapped, so vtables and function pointers
//! handed out by the package remain valid. Every value the host keeps that
//! points into a package (module trait objects, initializers, export tables)
//! travels with a clone of its unit's guard.
//!
//! When the last clone drops, the boundary-specific release runs (for native
//! units: `dlclose` and removal of the staged copy) and the census records
//! the unit as unloaded. With a reaper pool the release is queued there, so
//! whichever thread drops the last clone never blocks on the unmap. A release
//! that cannot be queued, or is still queued when the pool goes away, runs
//! where it is dropped.

use std::fmt;
use std::sync::Arc;

use dock_concurrency::ThreadPool;
use dock_core::UnitId;
use tracing::debug;

use crate::census::UnitCensus;

/// Release action run exactly once, when the last guard drops.
pub type Release = Box<dyn FnOnce() + Send + Sync>;

struct UnitImage {
    id: UnitId,
    package: String,
    release: Option<Release>,
    census: Arc<UnitCensus>,
    reaper: Option<Arc<ThreadPool>>,
}

impl Drop for UnitImage {
    fn drop(&mut self) {
        let retire = Retire {
            id: self.id,
            package: std::mem::take(&mut self.package),
            release: self.release.take(),
            census: self.census.clone(),
        };
        match &self.reaper {
            Some(pool) => {
                let label = format!("release {}", retire.id);
                // On failure the closure, and with it `retire`, drops here.
                if let Err(e) = pool.execute(label, move || drop(retire)) {
                    debug!(unit = %self.id, "Releasing inline: {}", e);
                }
            }
            None => drop(retire),
        }
    }
}

/// Runs the release and records the unload when dropped.
struct Retire {
    id: UnitId,
    package: String,
    release: Option<Release>,
    census: Arc<UnitCensus>,
}

impl Drop for Retire {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.census.record_unloaded(&self.package);
        debug!(unit = %self.id, package = %self.package, "Unit image released");
    }
}

/// Ref-counted guard keeping one unit image mapped.
#[derive(Clone)]
pub struct UnitGuard {
    inner: Arc<UnitImage>,
}

impl UnitGuard {
    /// Register a freshly mapped image with the census.
    pub fn new(
        id: UnitId,
        package: impl Into<String>,
        census: Arc<UnitCensus>,
        release: Option<Release>,
    ) -> Self {
        Self::build(id, package.into(), census, release, None)
    }

    /// Like [`UnitGuard::new`], but the release is queued on `reaper`.
    pub fn with_reaper(
        id: UnitId,
        package: impl Into<String>,
        census: Arc<UnitCensus>,
        release: Option<Release>,
        reaper: Arc<ThreadPool>,
    ) -> Self {
        Self::build(id, package.into(), census, release, Some(reaper))
    }

    fn build(
        id: UnitId,
        package: String,
        census: Arc<UnitCensus>,
        release: Option<Release>,
        reaper: Option<Arc<ThreadPool>>,
    ) -> Self {
        census.record_loaded(&package);
        Self {
            inner: Arc::new(UnitImage {
                id,
                package,
                release,
                census,
                reaper,
            }),
        }
    }

    /// Identifier of the guarded unit.
    pub fn unit_id(&self) -> UnitId {
        self.inner.id
    }

    /// Package the unit was loaded for.
    pub fn package(&self) -> &str {
        &self.inner.package
    }

    /// Number of live references to the image.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for UnitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitGuard")
            .field("unit", &self.inner.id)
            .field("package", &self.inner.package)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_release_runs_once_on_last_drop() {
        let census = Arc::new(UnitCensus::new());
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let guard = UnitGuard::new(
            UnitId::new(),
            "repoA",
            census.clone(),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
        );
        let clone = guard.clone();
        assert_eq!(guard.ref_count(), 2);
        assert_eq!(census.live_units(), 1);

        drop(guard);
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(census.live_units(), 1);

        drop(clone);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(census.live_units(), 0);
        assert_eq!(census.total_unloaded(), 1);
    }

    #[test]
    fn test_reaper_releases_on_worker_thread() {
        let census = Arc::new(UnitCensus::new());
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let (tx, rx) = std::sync::mpsc::channel();

        let guard = UnitGuard::with_reaper(
            UnitId::new(),
            "repoA",
            census.clone(),
            Some(Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send(name);
            })),
            pool.clone(),
        );
        drop(guard);

        let thread = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(thread.starts_with("dock-worker"), "released on {}", thread);
        assert_ne!(Some(thread.as_str()), std::thread::current().name());

        // The census is updated right after the release on the same worker.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while census.live_units() != 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(census.live_units(), 0);
        pool.join();
    }

    #[test]
    fn test_reaper_shut_down_releases_inline() {
        let census = Arc::new(UnitCensus::new());
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        pool.join();

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let guard = UnitGuard::with_reaper(
            UnitId::new(),
            "repoA",
            census.clone(),
            Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            pool,
        );
        drop(guard);

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(census.live_units(), 0);
    }
}
