//! Supervisor behaviour against in-memory workers.

mod common;

use std::time::Duration;

use common::{capabilities, tx_of, MockLauncher, MOCK_PID};
use plugin_workers::worker::protocol::{
    CreateDependenciesResultPayload, CreateNodesResultPayload, HostMessage, LoadResultPayload,
    PluginCapabilities, WorkerMessage,
};
use plugin_workers::worker::{
    Operation, PluginConfiguration, PluginWorkerPool, RawDependency, RemoteError,
    SupervisorOptions, WorkerError, WorkerExit,
};
use serde_json::json;

fn pool(launcher: std::sync::Arc<MockLauncher>) -> PluginWorkerPool {
    PluginWorkerPool::with_launcher(launcher, SupervisorOptions::default())
}

#[tokio::test]
async fn test_load_then_create_dependencies() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(
        PluginConfiguration::new("@acme/demo").with_options(json!({"flag": true})),
        "/repo",
    );

    let mut worker = workers.recv().await.unwrap();
    let load = worker.expect_load().await;
    assert_eq!(load.plugin.plugin, "@acme/demo");
    assert_eq!(load.plugin.options, Some(json!({"flag": true})));
    assert_eq!(load.root, std::path::PathBuf::from("/repo"));
    worker
        .send(&WorkerMessage::LoadResult(LoadResultPayload::loaded(
            capabilities("demo"),
        )))
        .await;

    let plugin = pending.await.unwrap();
    assert_eq!(plugin.name(), "demo");
    assert_eq!(plugin.create_nodes().unwrap().pattern(), "**/project.json");

    let op = plugin.create_dependencies().unwrap().clone();
    let call = tokio::spawn(async move { op.call(json!({}), json!({})).await });

    let request = worker.recv().await;
    let HostMessage::CreateDependencies(payload) = &request else {
        panic!("expected createDependencies, got {request:?}");
    };
    assert!(payload.tx.starts_with("demo:createDependencies:"));
    worker
        .reply_dependencies(&payload.tx, vec![RawDependency::new("a", "b")])
        .await;

    let dependencies = call.await.unwrap().unwrap();
    assert_eq!(dependencies, vec![RawDependency::new("a", "b")]);
}

#[tokio::test]
async fn test_missing_operations_are_absent() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("nodes-only"), "/repo");

    let mut worker = workers.recv().await.unwrap();
    worker
        .accept_load(PluginCapabilities {
            name: "nodes-only".to_string(),
            create_nodes_pattern: None,
            has_create_dependencies: false,
            has_process_project_graph: false,
        })
        .await;

    let plugin = pending.await.unwrap();
    assert!(plugin.create_nodes().is_none());
    assert!(plugin.create_dependencies().is_none());
    assert!(plugin.process_project_graph().is_none());
}

#[tokio::test]
async fn test_replies_correlate_by_transaction_id() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();

    let first = plugin.create_dependencies().unwrap().clone();
    let second = first.clone();
    let first = tokio::spawn(async move { first.call(json!({"n": 1}), json!({})).await });
    let first_tx = tx_of(&worker.recv().await);
    let second = tokio::spawn(async move { second.call(json!({"n": 2}), json!({})).await });
    let second_tx = tx_of(&worker.recv().await);
    assert_ne!(first_tx, second_tx);

    // Answer in reverse order.
    worker
        .reply_dependencies(&second_tx, vec![RawDependency::new("second", "x")])
        .await;
    worker
        .reply_dependencies(&first_tx, vec![RawDependency::new("first", "x")])
        .await;

    assert_eq!(first.await.unwrap().unwrap()[0].source, "first");
    assert_eq!(second.await.unwrap().unwrap()[0].source, "second");
}

#[tokio::test]
async fn test_crash_rejects_every_pending_call() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let op = plugin.create_dependencies().unwrap().clone();
            tokio::spawn(async move { op.call(json!({}), json!({})).await })
        })
        .collect();
    for _ in 0..5 {
        worker.recv().await;
    }

    worker.crash(WorkerExit::with_code(1));

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_worker_exited(), "unexpected error: {err}");
        let message = err.to_string();
        assert!(message.contains("demo"), "{message}");
        assert!(message.contains("exit code 1"), "{message}");
    }
    assert_eq!(shutdown.wait_for_exit().await, WorkerExit::with_code(1));
    assert!(!plugin.is_alive());

    // Calls after the exit fail straight away.
    let err = plugin
        .create_dependencies()
        .unwrap()
        .call(json!({}), json!({}))
        .await
        .unwrap_err();
    assert!(err.is_worker_exited());
}

#[tokio::test]
async fn test_exit_before_load_rejects_load() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");

    let mut worker = workers.recv().await.unwrap();
    worker.expect_load().await;
    worker.crash(WorkerExit::with_code(3));

    let err = pending.await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("plugin worker 'pid {MOCK_PID}' exited unexpectedly with exit code 3")
    );
}

#[tokio::test]
async fn test_load_failure_is_reported() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("@acme/missing"), "/repo");

    let mut worker = workers.recv().await.unwrap();
    worker.expect_load().await;
    worker
        .send_raw(
            "{\"type\":\"load-result\",\"payload\":{\"success\":false,\
             \"error\":{\"name\":\"Error\",\"message\":\"Cannot find module\"}}}\n",
        )
        .await;

    let err = pending.await.unwrap_err();
    let WorkerError::LoadFailed { plugin, error } = &err else {
        panic!("expected LoadFailed, got {err:?}");
    };
    assert_eq!(plugin, "@acme/missing");
    assert_eq!(error.message, "Cannot find module");
    assert_eq!(
        err.to_string(),
        "failed to load plugin '@acme/missing': Error: Cannot find module"
    );
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let pool = pool(MockLauncher::failing());
    let (pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");

    let err = pending.await.unwrap_err();
    assert!(matches!(err, WorkerError::SpawnFailed(_)), "{err:?}");
    shutdown.wait_for_exit().await;
    assert!(!shutdown.is_alive());
}

#[tokio::test]
async fn test_operation_failure_keeps_worker_usable() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap().clone();

    let failing = {
        let op = op.clone();
        tokio::spawn(async move { op.call(json!({}), json!({})).await })
    };
    let tx = tx_of(&worker.recv().await);
    worker
        .send(&WorkerMessage::CreateDependenciesResult(
            CreateDependenciesResultPayload::from_outcome(tx, Err(RemoteError::new("boom"))),
        ))
        .await;

    let err = failing.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        WorkerError::OperationFailed {
            operation: Operation::CreateDependencies,
            ..
        }
    ));
    assert_eq!(err.remote().unwrap().message, "boom");

    let succeeding = tokio::spawn(async move { op.call(json!({}), json!({})).await });
    let tx = tx_of(&worker.recv().await);
    worker.reply_dependencies(&tx, Vec::new()).await;
    assert!(succeeding.await.unwrap().unwrap().is_empty());
    assert!(plugin.is_alive());
}

#[tokio::test]
async fn test_duplicate_and_unknown_results_are_ignored() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap().clone();

    let call = {
        let op = op.clone();
        tokio::spawn(async move { op.call(json!({}), json!({})).await })
    };
    let tx = tx_of(&worker.recv().await);
    worker
        .reply_dependencies(&tx, vec![RawDependency::new("a", "b")])
        .await;
    worker
        .reply_dependencies(&tx, vec![RawDependency::new("c", "d")])
        .await;
    worker
        .reply_dependencies("demo:createDependencies:999", Vec::new())
        .await;
    worker.send_raw("this is not json\n").await;

    assert_eq!(
        call.await.unwrap().unwrap(),
        vec![RawDependency::new("a", "b")]
    );

    let next = tokio::spawn(async move { op.call(json!({}), json!({})).await });
    let tx = tx_of(&worker.recv().await);
    worker
        .reply_dependencies(&tx, vec![RawDependency::new("e", "f")])
        .await;
    assert_eq!(
        next.await.unwrap().unwrap(),
        vec![RawDependency::new("e", "f")]
    );
}

#[tokio::test]
async fn test_malformed_result_payload_rejects_its_call() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();

    let op = plugin.create_dependencies().unwrap().clone();
    let call = tokio::spawn(async move { op.call(json!({}), json!({})).await });
    let tx = tx_of(&worker.recv().await);
    worker
        .send_raw(&format!(
            "{{\"type\":\"createDependenciesResult\",\"payload\":{{\"tx\":\"{tx}\",\
             \"success\":true,\"dependencies\":[{{\"source\":\"a\",\"target\":\"b\",\
             \"type\":\"weird\"}}]}}}}\n"
        ))
        .await;

    let err = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("call should settle")
        .unwrap()
        .unwrap_err();
    let WorkerError::Protocol { worker: name, message } = &err else {
        panic!("expected Protocol, got {err:?}");
    };
    assert_eq!(name, "demo");
    assert!(message.contains(&tx), "{message}");

    tokio::time::timeout(Duration::from_secs(1), shutdown.shutdown())
        .await
        .expect("shutdown should not wait on the rejected call");
    worker.terminated().await;
}

#[tokio::test]
async fn test_malformed_load_result_rejects_load() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");

    let mut worker = workers.recv().await.unwrap();
    worker.expect_load().await;
    worker
        .send_raw("{\"type\":\"load-result\",\"payload\":{\"success\":\"yes\"}}\n")
        .await;

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("load should settle")
        .unwrap_err();
    assert!(matches!(err, WorkerError::Protocol { .. }), "{err:?}");
}

#[tokio::test]
async fn test_mismatched_result_kind_is_a_protocol_error() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();

    let op = plugin.create_dependencies().unwrap().clone();
    let call = tokio::spawn(async move { op.call(json!({}), json!({})).await });
    let tx = tx_of(&worker.recv().await);
    worker
        .send(&WorkerMessage::CreateNodesResult(
            CreateNodesResultPayload::from_outcome(tx, Ok(json!([]))),
        ))
        .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, WorkerError::Protocol { .. }), "{err:?}");
}

#[tokio::test]
async fn test_shutdown_waits_for_pending_calls() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap().clone();

    let call = {
        let op = op.clone();
        tokio::spawn(async move { op.call(json!({}), json!({})).await })
    };
    let tx = tx_of(&worker.recv().await);

    let stopping = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!worker.terminate_requested());
    assert!(!stopping.is_finished());

    let err = op.call(json!({}), json!({})).await.unwrap_err();
    assert!(matches!(err, WorkerError::ShuttingDown { .. }), "{err:?}");

    worker
        .reply_dependencies(&tx, vec![RawDependency::new("a", "b")])
        .await;
    assert_eq!(
        call.await.unwrap().unwrap(),
        vec![RawDependency::new("a", "b")]
    );
    stopping.await.unwrap();

    worker.terminated().await;
    worker.crash(WorkerExit::with_signal(9));
    assert_eq!(shutdown.wait_for_exit().await, WorkerExit::with_signal(9));
    assert!(pool.cleanup_registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_before_connect_still_terminates() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (_pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");

    shutdown.shutdown().await;

    let mut worker = workers.recv().await.unwrap();
    worker.terminated().await;
    worker.crash(WorkerExit::with_signal(9));
    assert_eq!(shutdown.wait_for_exit().await, WorkerExit::with_signal(9));
}

#[tokio::test]
async fn test_call_timeout() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = PluginWorkerPool::with_launcher(
        launcher,
        SupervisorOptions {
            call_timeout: Some(Duration::from_millis(50)),
            ..SupervisorOptions::default()
        },
    );
    let (pending, _shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap().clone();

    let err = op.call(json!({}), json!({})).await.unwrap_err();
    assert!(
        matches!(
            err,
            WorkerError::Timeout {
                operation: Operation::CreateDependencies,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(err.to_string().ends_with("timed out after 50ms"), "{err}");
    assert!(err.is_retriable());

    // A late reply is dropped and the worker keeps serving.
    let late = tx_of(&worker.recv().await);
    worker.reply_dependencies(&late, Vec::new()).await;

    let call = tokio::spawn(async move { op.call(json!({}), json!({})).await });
    let tx = tx_of(&worker.recv().await);
    worker
        .reply_dependencies(&tx, vec![RawDependency::new("a", "b")])
        .await;
    assert_eq!(call.await.unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn test_abandoned_call_does_not_block_shutdown() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (pending, shutdown) = pool.load_plugin(PluginConfiguration::new("demo"), "/repo");
    let mut worker = workers.recv().await.unwrap();
    worker.accept_load(capabilities("demo")).await;
    let plugin = pending.await.unwrap();
    let op = plugin.create_dependencies().unwrap().clone();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), op.call(json!({}), json!({}))).await;
    assert!(abandoned.is_err());
    worker.recv().await;

    tokio::time::timeout(Duration::from_secs(1), shutdown.shutdown())
        .await
        .expect("shutdown should not wait for a dropped call");
    worker.terminated().await;
}

#[tokio::test]
async fn test_cleanup_registry_terminates_live_workers() {
    let (launcher, mut workers) = MockLauncher::scripted();
    let pool = pool(launcher);
    let (first_pending, first) = pool.load_plugin(PluginConfiguration::new("one"), "/repo");
    let (second_pending, _second) = pool.load_plugin(PluginConfiguration::new("two"), "/repo");
    assert_eq!(pool.cleanup_registry().len(), 2);

    let mut a = workers.recv().await.unwrap();
    let mut b = workers.recv().await.unwrap();
    let name_a = a.configuration.plugin.clone();
    a.accept_load(capabilities(&name_a)).await;
    let name_b = b.configuration.plugin.clone();
    b.accept_load(capabilities(&name_b)).await;
    first_pending.await.unwrap();
    second_pending.await.unwrap();

    // Deliberate shutdown deregisters.
    let (mut deliberate, mut remaining) = if name_a == "one" { (a, b) } else { (b, a) };
    first.shutdown().await;
    deliberate.terminated().await;
    assert_eq!(pool.cleanup_registry().len(), 1);

    assert_eq!(pool.cleanup_registry().run_all(), 1);
    remaining.terminated().await;
    assert!(pool.cleanup_registry().is_empty());
}
