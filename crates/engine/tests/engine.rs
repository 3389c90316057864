#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    sandjob_engine::{
        AdmissionController, ArtifactStore, Engine, Error, ExecutionRequest, Failure,
        UploadResolver,
    },
    tokio_util::sync::CancellationToken,
};

use common::{FakeBackend, runtime};

fn engine(
    backend: &Arc<FakeBackend>,
    stage: &Path,
    capacity: usize,
    artifacts: Option<ArtifactStore>,
) -> Engine {
    Engine::with_parts(
        AdmissionController::new(capacity, Duration::from_millis(100)),
        runtime(backend, stage),
        artifacts,
    )
}

#[tokio::test]
async fn extra_caller_is_turned_away_when_capacity_is_held() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        run_for: Duration::from_secs(2),
        ..FakeBackend::ready()
    });
    let engine = Arc::new(engine(&backend, stage.path(), 2, None));
    engine.ensure_image().await;

    let mut running = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&engine);
        running.push(tokio::spawn(async move {
            engine
                .run(ExecutionRequest::new("import time; time.sleep(2)"), &CancellationToken::new())
                .await
        }));
    }
    while engine.admission().stats().active < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    let err = engine
        .run(ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AdmissionExhausted { capacity: 2 }));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(started.elapsed() < Duration::from_secs(2));

    for handle in running {
        assert!(handle.await.unwrap().unwrap().result.is_success());
    }
    let stats = engine.admission().stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processed, 2);
    assert_eq!(FakeBackend::count(&backend.creates), 2);
}

#[tokio::test]
async fn slot_is_released_after_a_failed_run() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        create_error: Some("daemon gone".into()),
        ..FakeBackend::ready()
    });
    let engine = engine(&backend, stage.path(), 1, None);
    engine.ensure_image().await;

    for _ in 0..3 {
        let err = engine
            .run(ExecutionRequest::new("print(1)"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure(_)));
    }
    assert_eq!(engine.admission().stats().active, 0);
    assert_eq!(engine.admission().stats().available, 1);
}

#[tokio::test]
async fn cancelled_while_waiting_for_a_slot() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::ready());
    let engine = engine(&backend, stage.path(), 1, None);
    let _held = engine.admission().try_acquire().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = engine.run(ExecutionRequest::new("print(1)"), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn outputs_are_registered_in_the_artifact_store() {
    let stage = tempfile::tempdir().unwrap();
    let base = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend {
        output_file: Some(("chart.csv".into(), "x,y\n1,2\n".into())),
        ..FakeBackend::ready()
    });
    let store = ArtifactStore::open(base.path(), Duration::from_secs(3600)).unwrap();
    let engine = engine(&backend, stage.path(), 1, Some(store));
    engine.ensure_image().await;

    let run = engine
        .run(ExecutionRequest::new("open('/output/chart.csv','w')"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.result.is_success());
    let id = run.execution_id.clone().expect("persisted run has an id");
    assert!(id.starts_with("exec-"));
    assert_eq!(run.files, vec!["chart.csv".to_string()]);

    let store = engine.artifacts().unwrap();
    assert_eq!(store.get_file(&id, "chart.csv").await.unwrap(), b"x,y\n1,2\n");
    assert!(matches!(
        store.get_file(&id, "../../etc/passwd").await,
        Err(Error::PathTraversal(_))
    ));

    let info = store.execution_info(&id).await.unwrap();
    assert_eq!(info.files, vec!["chart.csv".to_string()]);
    assert_eq!(info.expires_at - info.created_at, chrono::TimeDelta::hours(1));

    let json = serde_json::to_value(&run).unwrap();
    assert_eq!(json["execution_id"], id.as_str());
    assert_eq!(json["exit_code"], 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_runs_leave_no_artifact_directory() {
    let stage = tempfile::tempdir().unwrap();
    let base = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::ready());
    let store = ArtifactStore::open(base.path(), Duration::from_secs(3600)).unwrap();
    let engine = engine(&backend, stage.path(), 1, Some(store));
    engine.ensure_image().await;

    let request = ExecutionRequest::new("print(1)").with_inputs([PathBuf::from("../secret.csv")]);
    let run = engine.run(request, &CancellationToken::new()).await.unwrap();

    assert!(matches!(run.result.failure, Some(Failure::InputValidationFailed { .. })));
    assert!(run.execution_id.is_none());
    assert!(engine.artifacts().unwrap().list_executions().await.unwrap().is_empty());
    assert_eq!(FakeBackend::count(&backend.creates), 0);
}

#[tokio::test]
async fn artifacts_disabled_without_a_store() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::ready());
    let engine = engine(&backend, stage.path(), 1, None);
    engine.ensure_image().await;

    assert!(matches!(engine.artifacts(), Err(Error::ArtifactsDisabled)));
    let run = engine
        .run(ExecutionRequest::new("print(1)"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.execution_id.is_none());
    assert!(run.files.is_empty());
}

#[tokio::test]
async fn stats_report_limits_and_utilization() {
    let stage = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::ready());
    let engine = engine(&backend, stage.path(), 3, None);
    engine.ensure_image().await;

    let stats = engine.stats();
    assert_eq!(stats.backend, "fake");
    assert_eq!(stats.admission.capacity, 3);
    assert_eq!(stats.default_timeout_secs, 30);
    assert!(!stats.artifacts_enabled);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["image_state"]["state"], "ready");
    assert_eq!(json["limits"]["pids"], 256);
}

struct StaticUploads(HashMap<String, PathBuf>);

impl UploadResolver for StaticUploads {
    fn resolve(&self, reference: &str) -> sandjob_engine::Result<PathBuf> {
        self.0
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::NotFound(reference.to_string()))
    }
}

#[tokio::test]
async fn upload_references_resolve_to_mountable_inputs() {
    let stage = tempfile::tempdir().unwrap();
    let uploads = tempfile::tempdir().unwrap();
    let stored = uploads.path().join("a1b2_sales.csv");
    std::fs::write(&stored, "q,rev\n").unwrap();

    let backend = Arc::new(FakeBackend::ready());
    let engine = engine(&backend, stage.path(), 1, None).with_upload_resolver(Arc::new(
        StaticUploads(HashMap::from([("a1b2".to_string(), stored.clone())])),
    ));
    engine.ensure_image().await;

    let inputs = engine.resolve_inputs(&["upload://a1b2".to_string()]).unwrap();
    assert_eq!(inputs, vec![stored]);
    assert!(engine.resolve_inputs(&["upload://missing".to_string()]).unwrap_err().is_not_found());

    let run = engine
        .run(ExecutionRequest::new("pass").with_inputs(inputs), &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.result.is_success());
    assert!(backend
        .last_spec()
        .mounts
        .iter()
        .any(|m| m.target == "/data/input_0/a1b2_sales.csv"));
}
