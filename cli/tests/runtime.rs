//! Library-level runtime tests with a real worker child: mutex exclusion,
//! fail-fast on a dead worker, reset, and install failures.

use std::sync::Arc;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin;
use capstan_core::backend::BackendSpawnSpec;
use capstan_core::error::CapstanErr;
use capstan_core::runtime::Acquisition;
use capstan_core::runtime::Runtime;
use capstan_core::state_store::StateStore;
use capstan_core::worker::WorkerSpawnSpec;
use pretty_assertions::assert_eq;
use serde_json::json;

fn worker_spawn_spec() -> WorkerSpawnSpec {
    WorkerSpawnSpec {
        program: cargo_bin("capstan"),
        args: vec!["worker".to_string()],
    }
}

async fn start_runtime(dir: &std::path::Path) -> Arc<Runtime> {
    let store = StateStore::new(dir.join("state")).expect("store");
    Runtime::start(worker_spawn_spec(), store)
        .await
        .expect("runtime")
}

#[tokio::test]
async fn mutex_admits_exactly_one_outstanding_command() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = start_runtime(dir.path()).await;

    let result = runtime
        .execute("cmd = ShellCapability(commands=['sleep'])")
        .await
        .expect("execute");
    assert!(result.success, "{result:?}");

    let racer = Arc::clone(&runtime);
    let slow = tokio::spawn(async move {
        racer.execute("r = cmd.run(command='sleep 1')").await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // While the slow command holds the mutex, nothing else gets in.
    assert!(runtime.busy());
    assert!(runtime.acquire(Acquisition::NonBlocking).await.is_none());
    assert!(
        runtime
            .acquire(Acquisition::Timed(Duration::from_millis(100)))
            .await
            .is_none()
    );

    let slow_result = slow.await.expect("join").expect("slow execute");
    assert!(slow_result.success, "{slow_result:?}");
    assert!(!runtime.busy());

    // Both executes completed in order; the slow result is visible.
    let result = runtime.execute("r['exit_code']").await.expect("execute");
    assert_eq!(result.return_value, Some(json!(0)));

    runtime.shutdown().await;
}

#[tokio::test]
async fn reset_replaces_the_worker_and_clears_state() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = start_runtime(dir.path()).await;

    runtime.execute("x = 1").await.expect("execute");
    runtime.reset().await.expect("reset");

    let result = runtime.execute("x").await.expect("execute");
    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("NameError"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn describe_capability_rejects_non_identifiers() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = start_runtime(dir.path()).await;

    let err = runtime
        .describe_capability("math; print(1)")
        .await
        .err()
        .expect("reject");
    assert!(matches!(err, CapstanErr::CapabilityNotFound(_)), "{err}");

    let err = runtime
        .describe_capability("never_installed")
        .await
        .err()
        .expect("reject");
    assert!(matches!(err, CapstanErr::CapabilityNotFound(_)), "{err}");

    runtime.shutdown().await;
}

#[tokio::test]
async fn install_of_a_broken_backend_fails_cleanly() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = start_runtime(dir.path()).await;

    let spawn = BackendSpawnSpec::new("/nonexistent/backend-binary", Vec::new());
    let err = runtime
        .install_capability("ghost", spawn)
        .await
        .err()
        .expect("fail");
    assert!(matches!(err, CapstanErr::Io(_)), "{err}");

    // Nothing half-registered: calling through the session still fails with
    // a name error because no capability was injected.
    let result = runtime.execute("ghost").await.expect("execute");
    assert_eq!(result.error_type.as_deref(), Some("NameError"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn state_store_flows_through_save_and_restore() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let runtime = start_runtime(dir.path()).await;

    runtime.execute("greeting = 'hello'").await.expect("execute");
    let summary = runtime.save_state("roundtrip").await.expect("save");
    assert_eq!(summary.variables, 1);
    assert_eq!(runtime.list_saved_states().expect("list"), vec!["roundtrip"]);

    runtime.reset().await.expect("reset");
    let summary = runtime.restore_state("roundtrip").await.expect("restore");
    assert_eq!(summary.report.variables_restored, 1);

    let result = runtime.execute("greeting").await.expect("execute");
    assert_eq!(result.return_value, Some(json!("hello")));

    let err = runtime.restore_state("missing").await.err().expect("fail");
    assert!(matches!(err, CapstanErr::StateNotFound(_)), "{err}");

    assert!(runtime.delete_state("roundtrip").expect("delete"));
    assert!(runtime.list_saved_states().expect("list").is_empty());

    runtime.shutdown().await;
}
