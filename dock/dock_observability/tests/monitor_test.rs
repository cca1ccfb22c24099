//! Monitors observing real threads and units.

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dock_core::PackageExports;
use dock_isolation::{CatalogBoundary, IsolationBoundary, UnitCensus};
use dock_observability::{
    BlockedConfig, BlockedWorkerMonitor, LeakConfig, LeakDetector, MemoryProbe, ProcessTelemetry,
    RoleClassifier, Sampler, ThreadRegistry,
};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_blocked_reactor_flagged_and_cleared() {
    let census = Arc::new(UnitCensus::new());
    let registry = Arc::new(ThreadRegistry::new());
    let telemetry = Arc::new(ProcessTelemetry::new(
        census,
        registry.clone(),
        RoleClassifier::default(),
    ));
    let config = BlockedConfig {
        sample_interval_ms: 10,
        threshold_ms: 50,
        ..BlockedConfig::default()
    };
    let monitor = Arc::new(BlockedWorkerMonitor::new(config, telemetry));

    let ticking = monitor.clone();
    let _sampler = Sampler::spawn("dock-blocked-sampler", monitor.interval(), move || {
        ticking.sample();
    })
    .unwrap();

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let remote = registry.clone();
    let reactor = thread::Builder::new()
        .name("dock-reactor-0".to_string())
        .spawn(move || {
            let _frame = remote.enter("dispatch slow.v1");
            release_rx.recv().unwrap();
        })
        .unwrap();

    wait_until("reactor flagged", || monitor.is_any_reactor_thread_blocked());
    let record = monitor.records().remove(0);
    assert_eq!(record.name, "dock-reactor-0");
    assert!(record.critical);
    assert_eq!(record.stack, vec!["dispatch slow.v1"]);

    release_tx.send(()).unwrap();
    reactor.join().unwrap();

    wait_until("reactor cleared", || monitor.blocked_count() == 0);
    assert_eq!(monitor.max_blocked_duration(), Duration::ZERO);
}

#[test]
fn test_ledger_matches_census_after_close() {
    let census = Arc::new(UnitCensus::new());
    let boundary = CatalogBoundary::new(census.clone());
    boundary.register("repoA", PackageExports::new);

    let telemetry = Arc::new(ProcessTelemetry::new(
        census.clone(),
        Arc::new(ThreadRegistry::new()),
        RoleClassifier::default(),
    ));
    let detector = LeakDetector::new(LeakConfig::default(), telemetry, MemoryProbe::default());

    let unit = boundary.load("repoA", Path::new("bundle")).unwrap();
    detector.on_unit_created("repoA");
    assert_eq!(detector.estimate_leaked(), 0);

    // A reference kept past close keeps the unit loaded.
    let held = unit.guard();
    boundary.close(unit).unwrap_err();
    detector.on_unit_destroyed("repoA");
    assert_eq!(detector.estimate_leaked(), 1);

    let report = detector.report();
    assert_eq!(report.suspects[0].package, "repoA");
    assert_eq!(report.suspects[0].suspected_leaked(), 1);

    drop(held);
    assert_eq!(detector.estimate_leaked(), 0);
    assert!(!detector.reconcile().suspected);
}
