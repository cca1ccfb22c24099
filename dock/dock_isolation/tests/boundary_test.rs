//! Integration tests for isolation boundaries.

use std::path::Path;
use std::sync::Arc;

use dock_core::{
    async_trait, HookError, IsolationError, Module, ModuleClass, ModuleRequest, ModuleResponse,
    PackageExports,
};
use dock_isolation::{CatalogBoundary, IsolationBoundary, UnitCensus};

struct Echo;

#[async_trait]
impl Module for Echo {
    async fn handle(&self, request: ModuleRequest) -> Result<ModuleResponse, HookError> {
        Ok(ModuleResponse::ok(request.payload))
    }
}

fn echo_exports() -> PackageExports {
    PackageExports::new().module(ModuleClass::new("echo::Echo").with_default(|| Box::new(Echo)))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

#[test]
fn test_each_load_is_a_new_unit() {
    init_tracing();
    let census = Arc::new(UnitCensus::new());
    let boundary = CatalogBoundary::new(census.clone());
    boundary.register("repoA", echo_exports);

    let first = boundary.load("repoA", Path::new("bundle")).unwrap();
    let second = boundary.load("repoA", Path::new("bundle")).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(census.live_for("repoA"), 2);

    boundary.close(first).unwrap();
    boundary.close(second).unwrap();
    assert_eq!(census.live_units(), 0);
    assert_eq!(census.total_loaded(), 2);
    assert_eq!(census.total_unloaded(), 2);
}

#[test]
fn test_unknown_package() {
    let boundary = CatalogBoundary::new(Arc::new(UnitCensus::new()));
    let err = boundary.load("ghost", Path::new("bundle")).unwrap_err();
    assert!(matches!(err, IsolationError::PackageNotFound(p) if p == "ghost"));
}

#[tokio::test]
async fn test_outstanding_guard_defers_release() {
    init_tracing();
    let census = Arc::new(UnitCensus::new());
    let boundary = CatalogBoundary::new(census.clone());
    boundary.register("repoA", echo_exports);

    let unit = boundary.load("repoA", Path::new("bundle")).unwrap();
    let class = unit.exports().find_module("echo::Echo").unwrap().clone();
    let module = (class.default_ctor().unwrap())().unwrap();
    let held = unit.guard();

    let err = boundary.close(unit).unwrap_err();
    assert!(matches!(err, IsolationError::CloseFailed { .. }));
    assert_eq!(census.live_units(), 1);

    // The instance still works while its guard is held.
    let response = module.handle(ModuleRequest::new("echo", "hi")).await.unwrap();
    assert_eq!(response.body, "hi");

    drop(module);
    drop(held);
    assert_eq!(census.live_units(), 0);
}
