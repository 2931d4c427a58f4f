//! End-to-end tests against the demo worker binary.

#![cfg(unix)]

use std::path::Path;

use plugin_workers::config::WorkerSettings;
use plugin_workers::worker::{
    PluginConfiguration, PluginWorkerPool, RawDependency, WorkerError, WorkerExit,
};
use serde_json::{json, Value};

fn pool() -> PluginWorkerPool {
    PluginWorkerPool::new(&WorkerSettings::with_program(env!(
        "CARGO_BIN_EXE_demo-plugin-worker"
    )))
}

fn root() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR"))
}

fn demo(options: Value) -> PluginConfiguration {
    PluginConfiguration::new("demo").with_options(options)
}

#[tokio::test]
async fn test_demo_worker_serves_operations() {
    let pool = pool();
    let (pending, shutdown) = pool.load_plugin(
        demo(json!({
            "name": "demo",
            "createNodesPattern": "**/project.json",
            "dependencies": [{ "source": "a", "target": "b" }],
        })),
        root(),
    );
    let plugin = pending.await.unwrap();
    assert_eq!(plugin.name(), "demo");
    assert!(plugin.process_project_graph().is_none());

    let dependencies = plugin
        .create_dependencies()
        .unwrap()
        .call(json!({}), json!({}))
        .await
        .unwrap();
    assert_eq!(dependencies, vec![RawDependency::new("a", "b")]);

    let create_nodes = plugin.create_nodes().unwrap();
    assert_eq!(create_nodes.pattern(), "**/project.json");
    let nodes = create_nodes
        .call(vec!["apps/web/project.json".to_string()], json!({}))
        .await
        .unwrap();
    insta::assert_snapshot!(
        serde_json::to_string(&nodes).unwrap(),
        @r#"[["apps/web/project.json",{"projects":{"apps/web":{"root":"apps/web"}}}]]"#
    );

    shutdown.shutdown().await;
    assert_eq!(shutdown.wait_for_exit().await, WorkerExit::with_signal(9));
    assert!(!plugin.is_alive());
}

#[tokio::test]
async fn test_concurrent_calls_on_one_worker() {
    let pool = pool();
    let (pending, shutdown) = pool.load_plugin(
        demo(json!({
            "dependencies": [{ "source": "app", "target": "lib", "type": "static" }],
            "delayMillis": 100,
        })),
        root(),
    );
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap();

    let results = futures::future::join_all((0..4).map(|_| op.call(json!({}), json!({})))).await;
    for result in results {
        let dependencies = result.unwrap();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].target, "lib");
    }

    shutdown.shutdown().await;
}

#[tokio::test]
async fn test_crash_names_worker_and_exit_code() {
    let pool = pool();
    let (pending, shutdown) = pool.load_plugin(
        demo(json!({
            "dependencies": [],
            "crashOn": "createDependencies",
            "exitCode": 1,
        })),
        root(),
    );
    let plugin = pending.await.unwrap();

    let err = plugin
        .create_dependencies()
        .unwrap()
        .call(json!({}), json!({}))
        .await
        .unwrap_err();
    assert!(err.is_worker_exited(), "{err:?}");
    let message = err.to_string();
    assert!(message.contains("demo"), "{message}");
    assert!(message.contains("exit code 1"), "{message}");

    assert_eq!(shutdown.wait_for_exit().await, WorkerExit::with_code(1));
}

#[tokio::test]
async fn test_load_failure_from_worker() {
    let pool = pool();
    let (pending, shutdown) =
        pool.load_plugin(demo(json!({ "failLoad": "cannot resolve plugin" })), root());

    let err = pending.await.unwrap_err();
    assert!(matches!(err, WorkerError::LoadFailed { .. }), "{err:?}");
    assert_eq!(
        err.to_string(),
        "failed to load plugin 'demo': LoadError: cannot resolve plugin"
    );

    shutdown.shutdown().await;
    shutdown.wait_for_exit().await;
}

#[tokio::test]
async fn test_exit_during_load() {
    let pool = pool();
    let (pending, _shutdown) = pool.load_plugin(
        demo(json!({ "crashOn": "load", "exitCode": 2 })),
        root(),
    );

    let err = pending.await.unwrap_err();
    let WorkerError::WorkerExited { worker, exit } = &err else {
        panic!("expected WorkerExited, got {err:?}");
    };
    assert!(worker.starts_with("pid "), "{worker}");
    assert_eq!(*exit, WorkerExit::with_code(2));
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let pool = PluginWorkerPool::new(&WorkerSettings::with_program(
        "/nonexistent/plugin-worker-host",
    ));
    let (pending, _shutdown) = pool.load_plugin(demo(json!({})), root());

    let err = pending.await.unwrap_err();
    assert!(matches!(err, WorkerError::SpawnFailed(_)), "{err:?}");
}
