//! Reports worker-pool activity to the thread registry.

use std::cell::RefCell;
use std::sync::Arc;

use dock_concurrency::WorkerHooks;
use dock_observability::{ActivityGuard, ThreadRegistry};

thread_local! {
    static TASK_FRAME: RefCell<Option<ActivityGuard>> = const { RefCell::new(None) };
}

/// Marks pool threads busy for the duration of each task.
pub struct RegistryHooks {
    registry: Arc<ThreadRegistry>,
}

impl RegistryHooks {
    /// Report to `registry`.
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerHooks for RegistryHooks {
    fn on_worker_start(&self, _name: &str) {
        self.registry.register_current();
    }

    fn on_task_start(&self, label: &str) {
        let frame = self.registry.enter(label);
        TASK_FRAME.with(|slot| *slot.borrow_mut() = Some(frame));
    }

    fn on_task_end(&self) {
        TASK_FRAME.with(|slot| slot.borrow_mut().take());
    }

    fn on_worker_stop(&self) {
        TASK_FRAME.with(|slot| slot.borrow_mut().take());
        self.registry.deregister_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_concurrency::{ThreadPool, ThreadPoolConfig};
    use std::time::Instant;

    #[tokio::test]
    async fn test_pool_tasks_show_as_busy() {
        let registry = Arc::new(ThreadRegistry::new());
        let pool = ThreadPool::with_hooks(
            ThreadPoolConfig {
                threads: 1,
                ..Default::default()
            },
            Arc::new(RegistryHooks::new(registry.clone())),
        )
        .unwrap();

        let probe = registry.clone();
        let (name, frames) = pool
            .submit("deploy repoA", move || {
                let entry = probe.register_current();
                (entry.name().to_string(), entry.frames())
            })
            .unwrap()
            .join()
            .await
            .unwrap();
        assert_eq!(name, "dock-worker-0");
        assert_eq!(frames, vec!["deploy repoA"]);

        // The frame closes after the task returns.
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let idle = registry
                .entries()
                .iter()
                .filter(|e| e.name() == "dock-worker-0")
                .all(|e| e.busy_for(Instant::now()).is_none());
            if idle {
                break;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        pool.join();
        assert!(registry.entries().iter().all(|e| e.name() != "dock-worker-0"));
    }
}
