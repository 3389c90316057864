#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use {
    sandjob_engine::{
        ExecutionRequest, Failure, ImageState, InputRejection,
        runtime::{CANCELLED_EXIT_CODE, REJECTED_EXIT_CODE, TIMEOUT_EXIT_CODE},
    },
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
};

use common::{FakeBackend, runtime};

#[tokio::test]
async fn successful_run_returns_output() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        stdout: "42\n".into(),
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    assert_eq!(rt.ensure_image().await, ImageState::Ready);

    let result = rt
        .execute(&ExecutionRequest::new("print(42)"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "42\n");
    assert_eq!(FakeBackend::count(&backend.removes), 1);

    let spec = backend.last_spec();
    assert_eq!(spec.command, vec!["python3", "/sandbox/script.py"]);
    assert!(!spec.network_enabled);
    assert!(spec.mounts.iter().any(|m| m.target == "/sandbox/script.py" && m.read_only));

    // The workspace is gone once the call returns.
    assert_eq!(std::fs::read_dir(stage.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn nonzero_exit_is_classified() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        exit_code: 3,
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let result = rt
        .execute(&ExecutionRequest::new("raise SystemExit(3)"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.failure, Some(Failure::ExecutionFailed { exit_code: 3 }));
}

#[tokio::test]
async fn traversal_input_is_rejected_before_provisioning() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::ready());
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let request = ExecutionRequest::new("print(open('/data/input_0/passwd').read())")
        .with_inputs([PathBuf::from("../../etc/passwd")]);
    let result = rt.execute(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.exit_code, REJECTED_EXIT_CODE);
    assert!(matches!(
        result.failure,
        Some(Failure::InputValidationFailed {
            reason: InputRejection::ParentTraversal(_)
        })
    ));
    assert!(result.error_message().unwrap().contains("path traversal"));
    assert_eq!(FakeBackend::count(&backend.creates), 0);
}

#[tokio::test]
async fn inputs_are_mounted_read_only_by_index() {
    let stage = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let first = data.path().join("sales.csv");
    let second = data.path().join("costs.csv");
    std::fs::write(&first, "a,b\n").unwrap();
    std::fs::write(&second, "c,d\n").unwrap();

    let backend = Arc::new(FakeBackend::ready());
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let request = ExecutionRequest::new("pass").with_inputs([first, second]);
    let result = rt.execute(&request, &CancellationToken::new()).await.unwrap();
    assert!(result.is_success());

    let spec = backend.last_spec();
    let targets: Vec<_> = spec
        .mounts
        .iter()
        .filter(|m| m.read_only && m.target.starts_with("/data/"))
        .map(|m| m.target.as_str())
        .collect();
    assert_eq!(targets, vec!["/data/input_0/sales.csv", "/data/input_1/costs.csv"]);
}

#[tokio::test]
async fn timeout_kills_and_removes_the_container() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        run_for: Duration::from_secs(60),
        stdout: "started\n".into(),
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let request = ExecutionRequest::new("import time; time.sleep(60)")
        .with_timeout(Duration::from_millis(200));
    let result = rt.execute(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(matches!(result.failure, Some(Failure::ExecutionTimeout { .. })));
    assert!(result.duration < Duration::from_secs(10));
    assert_eq!(result.stdout, "started\n");
    assert_eq!(FakeBackend::count(&backend.kills), 1);
    assert_eq!(FakeBackend::count(&backend.removes), 1);
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        run_for: Duration::from_secs(60),
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = rt.execute(&ExecutionRequest::new("while True: pass"), &cancel).await.unwrap();
    assert_eq!(result.exit_code, CANCELLED_EXIT_CODE);
    assert_eq!(result.failure, Some(Failure::Cancelled));
    assert_eq!(FakeBackend::count(&backend.kills), 1);
    assert_eq!(FakeBackend::count(&backend.removes), 1);
}

#[tokio::test]
async fn image_not_ready_until_background_pull_finishes() {
    let stage = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(FakeBackend {
        image_present: AtomicBool::new(false),
        pull_gate: Some(Arc::clone(&gate)),
        ..Default::default()
    });
    let rt = runtime(&backend, stage.path());

    assert_eq!(rt.ensure_image().await, ImageState::Building);
    let result = rt
        .execute(&ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.failure, Some(Failure::ImageNotReady));
    assert!(result.error_message().unwrap().contains("try again"));
    assert_eq!(FakeBackend::count(&backend.creates), 0);

    gate.notify_one();
    assert_eq!(rt.wait_until_ready(Duration::from_secs(5)).await, ImageState::Ready);

    let result = rt
        .execute(&ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(FakeBackend::count(&backend.creates), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn failed_preparation_is_reported_on_every_execute() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        pull_error: Some("registry unreachable".into()),
        build_error: Some("no space left on device".into()),
        ..Default::default()
    });
    let rt = runtime(&backend, stage.path());

    rt.ensure_image().await;
    let state = rt.wait_until_ready(Duration::from_secs(5)).await;
    let ImageState::Failed(message) = state.clone() else {
        panic!("expected failure, got {state:?}");
    };
    assert!(message.contains("registry unreachable"));
    assert!(message.contains("no space left on device"));

    for _ in 0..2 {
        let result = rt
            .execute(&ExecutionRequest::new("print(1)"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result.failure, Some(Failure::ImageBuildFailed { .. })));
    }
    // Failed is sticky: asking again does not retry.
    rt.ensure_image().await;
    assert_eq!(FakeBackend::count(&backend.pulls), 1);
    assert_eq!(FakeBackend::count(&backend.creates), 0);
}

#[tokio::test]
async fn create_failure_is_an_infrastructure_error() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        create_error: Some("daemon not responding".into()),
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let err = rt
        .execute(&ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, sandjob_engine::Error::Infrastructure(_)));
    assert!(err.to_string().contains("daemon not responding"));
    assert_eq!(std::fs::read_dir(stage.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn wait_failure_is_infrastructure_and_container_is_removed() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        wait_error: Some("connection reset by daemon".into()),
        ..FakeBackend::ready()
    });
    let rt = runtime(&backend, stage.path());
    rt.ensure_image().await;

    let err = rt
        .execute(&ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, sandjob_engine::Error::Infrastructure(_)));
    assert_eq!(FakeBackend::count(&backend.starts), 1);
    assert_eq!(FakeBackend::count(&backend.removes), 1);
    assert_eq!(std::fs::read_dir(stage.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn abandoned_run_still_removes_its_container() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        run_for: Duration::from_secs(60),
        ..FakeBackend::ready()
    });
    let rt = Arc::new(runtime(&backend, stage.path()));
    rt.ensure_image().await;

    let handle = tokio::spawn({
        let rt = Arc::clone(&rt);
        async move {
            rt.execute(&ExecutionRequest::new("while True: pass"), &CancellationToken::new())
                .await
        }
    });
    for _ in 0..200 {
        if FakeBackend::count(&backend.starts) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(FakeBackend::count(&backend.starts), 1);

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    // Removal is scheduled from the guard's drop onto the runtime.
    for _ in 0..200 {
        if FakeBackend::count(&backend.removes) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(FakeBackend::count(&backend.removes), 1);
    assert_eq!(FakeBackend::count(&backend.kills), 0);
    assert_eq!(std::fs::read_dir(stage.path()).unwrap().count(), 0);
}
