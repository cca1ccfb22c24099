//! The demo package built as a separate `cdylib` and served from native units.
//!
//! The bundle is compiled by its own cargo invocation, so it links its own
//! copies of std and dock_core: panics, service lookups and unit release all
//! cross a real library boundary here.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use dock_core::{DispatchError, HookError, ModuleRequest};
use dock_runtime::package::layout::bundle_file_name;
use dock_runtime::{BoundaryKind, DockRuntime, RuntimeConfig};
use serde_json::json;
use tempfile::TempDir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap()
}

/// Build `dock_demo` into a target directory of its own and return the library.
fn build_demo_bundle() -> PathBuf {
    let target = Path::new(env!("CARGO_TARGET_TMPDIR")).join("demo-bundle");
    let status = Command::new(env!("CARGO"))
        .current_dir(workspace_root())
        .args(["build", "--quiet", "-p", "dock_demo", "--lib", "--target-dir"])
        .arg(&target)
        .status()
        .unwrap();
    assert!(status.success(), "building dock_demo failed: {}", status);

    let bundle = target.join("debug").join(bundle_file_name("dock_demo"));
    assert!(bundle.is_file(), "no bundle at {}", bundle.display());
    bundle
}

fn stage_package(root: &Path, bundle: &Path) {
    let manifests = root.join("dock_demo/config");
    fs::create_dir_all(&manifests).unwrap();
    for entry in fs::read_dir(workspace_root().join("dock_demo/config")).unwrap() {
        let path = entry.unwrap().path();
        fs::copy(&path, manifests.join(path.file_name().unwrap())).unwrap();
    }

    let build = root.join("dock_demo/build");
    fs::create_dir_all(&build).unwrap();
    fs::copy(bundle, build.join(bundle_file_name("dock_demo"))).unwrap();
}

async fn send(runtime: &DockRuntime, address: &str, payload: &str) -> Result<String, DispatchError> {
    let response = runtime
        .dispatch(address, ModuleRequest::new(address, payload.to_string()))
        .await?;
    Ok(String::from_utf8(response.body.to_vec()).unwrap())
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_demo_bundle_in_native_units() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();

    let bundle = build_demo_bundle();
    let dir = TempDir::new().unwrap();
    stage_package(dir.path(), &bundle);

    let shadow = dir.path().join("shadow");
    let mut config = RuntimeConfig::default();
    config.packages_root = dir.path().to_path_buf();
    config.shadow_dir = shadow.clone();
    config.worker_pool.threads = 2;
    config.global = json!({"greeting": "hello"});
    let runtime = DockRuntime::new(config, BoundaryKind::Native).unwrap();
    let census = runtime.system.census().clone();

    let first = runtime.deploy("dock_demo").await.unwrap();
    assert_eq!(first.shared_initializer.as_deref(), Some("demo::Init"));
    assert!(first.addresses.iter().any(|a| a == "fragile.v1"));

    // The greeting reaches the bundle through the host's service registry.
    assert_eq!(send(&runtime, "greet.v1", "you").await.unwrap(), "hello you!");
    assert_eq!(send(&runtime, "echo.v1", "ping").await.unwrap(), "ping");
    assert_eq!(send(&runtime, "upper.v1", "abc").await.unwrap(), "ABC");

    // A panic inside the bundle comes back as an error, not an abort.
    let err = send(&runtime, "fragile.v1", "x").await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::HandlerFailed { source: HookError::Panicked(ref m), .. } if m.contains("gave way")
    ));
    assert_eq!(send(&runtime, "echo.v1", "after").await.unwrap(), "after");

    // A redeploy maps a fresh image; the old one is released.
    let second = runtime.deploy("dock_demo").await.unwrap();
    assert_ne!(first.unit, second.unit);
    assert_eq!(census.total_loaded(), 2);
    wait_until("first unit released", || census.live_for("dock_demo") == 1).await;
    assert_eq!(send(&runtime, "greet.v1", "again").await.unwrap(), "hello again!");

    runtime.undeploy(None).await;
    wait_until("units released", || census.live_for("dock_demo") == 0).await;
    assert_eq!(census.total_unloaded(), 2);
    wait_until("staged copies removed", || {
        fs::read_dir(&shadow).map(|d| d.count() == 0).unwrap_or(true)
    })
    .await;
    assert!(matches!(
        send(&runtime, "echo.v1", "gone").await,
        Err(DispatchError::AddressNotFound(_))
    ));

    runtime.shutdown().await.unwrap();
}
