//! End-to-end tests for `LearnWorker::handle_learn` against the in-memory
//! store, the mock container runtime and the mock peer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiln_artifact::{
  ArtifactKind, ArtifactMetadata, ArtifactStore, ByteStream, MemoryArtifactStore, ModelRecord,
};
use kiln_container::{
  ContainerError, MOCK_MODEL_FILE, MODEL_TARGET, MockRuntime, Mount, RunMode, default_handler,
  mounted_at,
};
use kiln_orchestrator::{
  ChannelNotifier, LearnError, LearnEvent, LearnWorker, Stage, TransportError, WorkerConfig,
  archive,
};
use kiln_peer::{MockPeer, PeerError};
use kiln_task::{TaskStatus, WorkerId};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Fixture {
  dir: tempfile::TempDir,
  store: MemoryArtifactStore,
  runtime: MockRuntime,
  peer: MockPeer,
  worker_id: WorkerId,
  problem: Uuid,
  algo: Uuid,
  train: Vec<Uuid>,
  test: Vec<Uuid>,
  model_end: Uuid,
}

impl Fixture {
  fn new() -> Self {
    Self::with_runtime(MockRuntime::new())
  }

  fn with_runtime(runtime: MockRuntime) -> Self {
    let store = MemoryArtifactStore::new();
    let problem = Uuid::new_v4();
    let algo = Uuid::new_v4();
    let train = vec![Uuid::new_v4(), Uuid::new_v4()];
    let test = vec![Uuid::new_v4()];

    store.insert(ArtifactKind::Problem, problem, &b"problem image"[..]);
    store.insert(ArtifactKind::Algo, algo, &b"algo image"[..]);
    for id in train.iter().chain(test.iter()) {
      store.insert(ArtifactKind::Data, *id, format!("rows of {}", id).into_bytes());
    }

    Self {
      dir: tempfile::tempdir().unwrap(),
      store,
      runtime,
      peer: MockPeer::new(),
      worker_id: WorkerId::generate(),
      problem,
      algo,
      train,
      test,
      model_end: Uuid::new_v4(),
    }
  }

  fn config(&self) -> WorkerConfig {
    WorkerConfig::new(self.dir.path())
  }

  fn worker(&self) -> LearnWorker {
    LearnWorker::new(
      self.config(),
      Arc::new(self.store.clone()),
      Arc::new(self.runtime.clone()),
      Arc::new(self.peer.clone()),
    )
  }

  fn payload(&self, rank: u32, model_start: Option<Uuid>) -> Vec<u8> {
    serde_json::to_vec(&json!({
      "key": "learnuplet-1",
      "problem": self.problem,
      "algo": self.algo,
      "train_data": self.train,
      "test_data": self.test,
      "model_start": model_start,
      "model_end": self.model_end,
      "rank": rank,
      "status": "todo",
    }))
    .unwrap()
  }

  fn workspace_root(&self) -> std::path::PathBuf {
    self.dir.path().join(self.algo.to_string())
  }

  fn assert_released(&self) {
    assert!(
      !self.workspace_root().exists(),
      "workspace should be removed"
    );
    assert!(
      self.runtime.loaded().is_empty(),
      "images still loaded: {:?}",
      self.runtime.loaded()
    );
  }
}

/// Pack `files` into a model archive and return its bytes.
async fn model_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
  let dir = tempfile::tempdir().unwrap();
  let model = dir.path().join("model");
  std::fs::create_dir_all(&model).unwrap();
  for (name, content) in files {
    std::fs::write(model.join(name), content).unwrap();
  }
  let path = dir.path().join("model.tar.gz");
  archive::pack_dir(&model, &path).await.unwrap();
  std::fs::read(path).unwrap()
}

async fn unpack_bytes(data: &[u8], dest: &Path) {
  let archive_path = dest.join("archive.tar.gz");
  let out = dest.join("out");
  std::fs::create_dir_all(&out).unwrap();
  std::fs::write(&archive_path, data).unwrap();
  archive::unpack(&archive_path, &out).await.unwrap();
}

/// Delegates to a memory store, except that fetching `swapped` yields its
/// bytes and then replaces the file at `dest` with an empty one.
struct SwappingStore {
  inner: MemoryArtifactStore,
  swapped: Uuid,
  dest: std::path::PathBuf,
}

#[async_trait]
impl ArtifactStore for SwappingStore {
  async fn fetch(&self, kind: ArtifactKind, id: Uuid) -> Result<ByteStream, kiln_artifact::Error> {
    let data = self.inner.fetch(kind, id).await?;
    if id != self.swapped {
      return Ok(data);
    }

    let dest = self.dest.clone();
    let swap = futures::stream::once(async move {
      std::fs::rename(&dest, dest.with_extension("moved")).unwrap();
      std::fs::write(&dest, b"").unwrap();
    })
    .filter_map(|()| async { None::<Result<Bytes, kiln_artifact::Error>> });
    Ok(Box::pin(data.chain(swap)))
  }

  async fn fetch_metadata(
    &self,
    kind: ArtifactKind,
    id: Uuid,
  ) -> Result<ArtifactMetadata, kiln_artifact::Error> {
    self.inner.fetch_metadata(kind, id).await
  }

  async fn store_model(
    &self,
    model: &ModelRecord,
    data: ByteStream,
    size: u64,
  ) -> Result<(), kiln_artifact::Error> {
    self.inner.store_model(model, data, size).await
  }
}

#[tokio::test]
async fn test_successful_learn_reports_done() {
  let fx = Fixture::new();

  let outcome = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();

  assert_eq!(outcome.task_key, "learnuplet-1");
  assert_eq!(outcome.model, fx.model_end);
  assert_eq!(outcome.performance.perf, 0.5);
  assert_eq!(outcome.performance.train_perf.get("p"), Some(&0.5));
  assert_eq!(outcome.performance.test_perf.get("p"), Some(&0.5));

  assert_eq!(
    fx.peer.claims(),
    vec![("learnuplet-1".to_string(), fx.worker_id)]
  );
  let reports = fx.peer.reports();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].status, TaskStatus::Done);
  assert_eq!(reports[0].performance, outcome.performance);

  let problem_image = format!("problem-{}", fx.problem);
  let algo_image = format!("algo-{}", fx.algo);
  assert_eq!(
    fx.runtime.runs(),
    vec![
      (problem_image.clone(), RunMode::Detarget),
      (algo_image, RunMode::Train),
      (problem_image, RunMode::Evaluate),
    ]
  );

  fx.assert_released();
}

#[tokio::test]
async fn test_concurrent_staging_fetches_every_data_set_once() {
  let fx = Fixture::new();
  let mut config = fx.config();
  config.staging_concurrency = 4;
  let worker = LearnWorker::new(
    config,
    Arc::new(fx.store.clone()),
    Arc::new(fx.runtime.clone()),
    Arc::new(fx.peer.clone()),
  );

  worker
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();

  let mut data_fetches: Vec<Uuid> = fx
    .store
    .fetches()
    .into_iter()
    .filter(|(kind, _)| *kind == ArtifactKind::Data)
    .map(|(_, id)| id)
    .collect();
  let mut expected: Vec<Uuid> = fx.train.iter().chain(fx.test.iter()).copied().collect();
  data_fetches.sort();
  expected.sort();
  assert_eq!(data_fetches, expected);
  fx.assert_released();
}

#[tokio::test]
async fn test_stored_model_matches_trained_model() {
  let fx = Fixture::new();

  fx.worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();

  let models = fx.store.stored_models();
  assert_eq!(models.len(), 1);
  assert_eq!(models[0].record.id, fx.model_end);
  assert_eq!(models[0].record.algo, fx.algo);
  assert_eq!(models[0].declared_size, models[0].data.len() as u64);

  let scratch = tempfile::tempdir().unwrap();
  unpack_bytes(&models[0].data, scratch.path()).await;
  let out = scratch.path().join("out");
  assert_eq!(
    archive::list_files(&out).unwrap(),
    vec![std::path::PathBuf::from(MOCK_MODEL_FILE)]
  );
  assert_eq!(
    std::fs::read_to_string(out.join(MOCK_MODEL_FILE)).unwrap(),
    format!("trained by algo-{}", fx.algo)
  );
}

#[tokio::test]
async fn test_rank_zero_never_fetches_a_model() {
  let fx = Fixture::new();
  let ignored = Uuid::new_v4();

  fx.worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, Some(ignored)))
    .await
    .unwrap();

  assert!(
    fx.store
      .fetches()
      .iter()
      .all(|(kind, _)| *kind != ArtifactKind::Model)
  );
  assert!(fx.store.metadata_fetches().is_empty());
}

#[tokio::test]
async fn test_rank_without_seed_is_rejected_before_any_call() {
  let fx = Fixture::new();

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(2, None))
    .await
    .unwrap_err();

  assert!(matches!(err, LearnError::Validation(_)));
  assert_eq!(err.stage(), Stage::Decode);
  assert_eq!(fx.store.call_count(), 0);
  assert!(fx.runtime.calls().is_empty());
  assert_eq!(fx.peer.call_count(), 0);
  assert!(!fx.workspace_root().exists());
}

#[tokio::test]
async fn test_garbage_payload_is_rejected() {
  let fx = Fixture::new();

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, b"{not json")
    .await
    .unwrap_err();

  assert!(matches!(err, LearnError::Validation(_)));
  assert_eq!(fx.peer.call_count(), 0);
}

#[tokio::test]
async fn test_seed_model_is_unpacked_before_training() {
  let seen = Arc::new(Mutex::new(None::<String>));
  let observed = seen.clone();
  let runtime = MockRuntime::with_handler(Arc::new(
    move |image: &str, mode: RunMode, mounts: &[Mount]| -> Result<(), ContainerError> {
      if mode == RunMode::Train
        && let Some(model) = mounted_at(mounts, MODEL_TARGET)
      {
        *observed.lock().unwrap() = std::fs::read_to_string(model.join("seed.txt")).ok();
      }
      default_handler(image, mode, mounts)
    },
  ));
  let fx = Fixture::with_runtime(runtime);

  let model_start = Uuid::new_v4();
  fx.store.insert(
    ArtifactKind::Model,
    model_start,
    model_archive(&[("seed.txt", b"epoch 4")]).await,
  );
  fx.store.insert_metadata(
    ArtifactKind::Model,
    ArtifactMetadata {
      id: model_start,
      name: "seed".to_string(),
      algo: Some(fx.algo),
    },
  );

  fx.worker()
    .handle_learn(&fx.worker_id, &fx.payload(1, Some(model_start)))
    .await
    .unwrap();

  assert_eq!(seen.lock().unwrap().as_deref(), Some("epoch 4"));
  assert!(
    fx.store
      .fetches()
      .contains(&(ArtifactKind::Model, model_start))
  );

  // The packaged model carries the seed forward.
  let scratch = tempfile::tempdir().unwrap();
  unpack_bytes(&fx.store.stored_models()[0].data, scratch.path()).await;
  let files = archive::list_files(&scratch.path().join("out")).unwrap();
  assert!(files.contains(&std::path::PathBuf::from("seed.txt")));
  assert!(files.contains(&std::path::PathBuf::from(MOCK_MODEL_FILE)));
  fx.assert_released();
}

#[tokio::test]
async fn test_seed_from_other_algo_fails() {
  let fx = Fixture::new();
  let model_start = Uuid::new_v4();
  fx.store.insert(
    ArtifactKind::Model,
    model_start,
    model_archive(&[("seed.txt", b"x")]).await,
  );
  fx.store.insert_metadata(
    ArtifactKind::Model,
    ArtifactMetadata {
      id: model_start,
      name: "seed".to_string(),
      algo: Some(Uuid::new_v4()),
    },
  );

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(1, Some(model_start)))
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    LearnError::Workflow {
      stage: Stage::SeedModel,
      ..
    }
  ));
  assert!(fx.runtime.runs().is_empty());
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}

#[tokio::test]
async fn test_train_failure_reports_failed_without_upload() {
  let fx = Fixture::new();
  fx.runtime.fail_run(RunMode::Train);

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::Train);
  assert!(matches!(
    err,
    LearnError::Transport {
      source: TransportError::Container(_),
      ..
    }
  ));

  let reports = fx.peer.reports();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].status, TaskStatus::Failed);
  assert_eq!(reports[0].performance.perf, 0.0);
  assert!(reports[0].performance.train_perf.is_empty());
  assert!(reports[0].performance.test_perf.is_empty());

  assert_eq!(fx.store.upload_attempts(), 0);
  assert!(
    !fx
      .runtime
      .runs()
      .iter()
      .any(|(_, mode)| *mode == RunMode::Evaluate)
  );
  fx.assert_released();
}

#[tokio::test]
async fn test_staging_failure_names_the_data_set() {
  let fx = Fixture::new();
  let broken = fx.train[1];
  fx.store.fail_fetch(broken);

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::StageData);
  assert!(
    err.to_string().contains(&broken.to_string()),
    "error should name {}: {}",
    broken,
    err
  );
  assert!(fx.runtime.runs().is_empty());
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}

#[tokio::test]
async fn test_missing_image_fails_and_releases_loaded_ones() {
  let fx = Fixture::new();
  let fx = Fixture {
    algo: Uuid::new_v4(),
    ..fx
  };

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::LoadImages);
  assert!(err.to_string().contains(&format!("algo {}", fx.algo)));
  // The problem image loaded before the failure and is unloaded again.
  assert!(
    fx.runtime
      .calls()
      .iter()
      .any(|c| matches!(c, kiln_container::RuntimeCall::Unload { name } if name.starts_with("problem-")))
  );
  fx.assert_released();
}

#[tokio::test]
async fn test_upload_failure_reports_failed() {
  let fx = Fixture::new();
  fx.store.fail_uploads();

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::PackageModel);
  assert_eq!(fx.store.upload_attempts(), 1);
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}

#[tokio::test]
async fn test_invalid_performance_file_reports_failed() {
  let runtime = MockRuntime::with_handler(Arc::new(
    |image: &str, mode: RunMode, mounts: &[Mount]| -> Result<(), ContainerError> {
      default_handler(image, mode, mounts)?;
      if mode == RunMode::Evaluate
        && let Some(perf) = mounted_at(mounts, kiln_container::PERF_TARGET)
      {
        std::fs::write(perf.join("performance.json"), "not json")?;
      }
      Ok(())
    },
  ));
  let fx = Fixture::with_runtime(runtime);

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::ParsePerf);
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}

#[tokio::test]
async fn test_failed_failure_report_keeps_both_errors() {
  let fx = Fixture::new();
  fx.runtime.fail_run(RunMode::Train);
  fx.peer.fail_reports(TaskStatus::Failed);

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  match &err {
    LearnError::Reporting { cause, report } => {
      assert_eq!(cause.stage(), Stage::Train);
      assert!(matches!(report, PeerError::Rejected(_)));
    }
    other => panic!("expected a reporting error, got {:?}", other),
  }
  assert_eq!(err.stage(), Stage::Train);
  assert_eq!(fx.peer.reports().len(), 1);
  fx.assert_released();
}

#[tokio::test]
async fn test_failed_done_report_is_an_error() {
  let fx = Fixture::new();
  fx.peer.fail_reports(TaskStatus::Done);

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::Report);
  // The model was uploaded before the report went out.
  assert_eq!(fx.store.stored_models().len(), 1);
  assert_eq!(fx.peer.reports().len(), 1);
  fx.assert_released();
}

#[tokio::test]
async fn test_claim_failure_touches_nothing() {
  let fx = Fixture::new();
  fx.peer.fail_claims();

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::Claim);
  assert!(fx.peer.reports().is_empty());
  assert_eq!(fx.store.call_count(), 0);
  assert!(fx.runtime.calls().is_empty());
  assert!(!fx.workspace_root().exists());
}

#[tokio::test]
async fn test_events_follow_the_pipeline() {
  let fx = Fixture::new();
  let (tx, mut rx) = mpsc::unbounded_channel();
  let worker = LearnWorker::with_notifier(
    fx.config(),
    Arc::new(fx.store.clone()),
    Arc::new(fx.runtime.clone()),
    Arc::new(fx.peer.clone()),
    ChannelNotifier::new(tx),
  );

  worker
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();
  drop(worker);

  let mut events = Vec::new();
  while let Some(event) = rx.recv().await {
    events.push(event);
  }

  assert_eq!(
    events.first(),
    Some(&LearnEvent::TaskReceived {
      task_key: "learnuplet-1".to_string()
    })
  );
  assert_eq!(
    events.last(),
    Some(&LearnEvent::TaskSucceeded {
      task_key: "learnuplet-1".to_string()
    })
  );

  let started: Vec<Stage> = events
    .iter()
    .filter_map(|e| match e {
      LearnEvent::StageStarted { stage, .. } => Some(*stage),
      _ => None,
    })
    .collect();
  assert_eq!(
    started,
    vec![
      Stage::Claim,
      Stage::PrepareWorkspace,
      Stage::LoadImages,
      Stage::StageData,
      Stage::UntargetTestData,
      Stage::Train,
      Stage::ComputePerf,
      Stage::PackageModel,
      Stage::ParsePerf,
      Stage::Report,
      Stage::Cleanup,
    ]
  );
  assert!(
    !events
      .iter()
      .any(|e| matches!(e, LearnEvent::StageFailed { .. }))
  );
}

#[tokio::test]
async fn test_failure_events_name_the_stage() {
  let fx = Fixture::new();
  fx.runtime.fail_run(RunMode::Detarget);
  let (tx, mut rx) = mpsc::unbounded_channel();
  let worker = LearnWorker::with_notifier(
    fx.config(),
    Arc::new(fx.store.clone()),
    Arc::new(fx.runtime.clone()),
    Arc::new(fx.peer.clone()),
    ChannelNotifier::new(tx),
  );

  assert!(
    worker
      .handle_learn(&fx.worker_id, &fx.payload(0, None))
      .await
      .is_err()
  );
  drop(worker);

  let mut failed = Vec::new();
  let mut task_failed = false;
  while let Some(event) = rx.recv().await {
    match event {
      LearnEvent::StageFailed { stage, .. } => failed.push(stage),
      LearnEvent::TaskFailed { .. } => task_failed = true,
      _ => {}
    }
  }
  assert_eq!(failed, vec![Stage::UntargetTestData]);
  assert!(task_failed);
}

#[tokio::test]
async fn test_stale_workspace_does_not_leak_into_task() {
  let fx = Fixture::new();
  let model = fx.workspace_root().join("model");
  let perf = fx.workspace_root().join("perf");
  std::fs::create_dir_all(&model).unwrap();
  std::fs::create_dir_all(&perf).unwrap();
  std::fs::write(model.join("left_by_killed_run.bin"), b"old weights").unwrap();
  std::fs::write(perf.join("performance.json"), br#"{"perf":0.99}"#).unwrap();

  let outcome = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();
  assert_eq!(outcome.performance.perf, 0.5);

  let scratch = tempfile::tempdir().unwrap();
  unpack_bytes(&fx.store.stored_models()[0].data, scratch.path()).await;
  assert_eq!(
    archive::list_files(&scratch.path().join("out")).unwrap(),
    vec![std::path::PathBuf::from(MOCK_MODEL_FILE)]
  );
  fx.assert_released();
}

#[tokio::test]
async fn test_missing_performance_file_is_not_read_from_stale_tree() {
  let runtime = MockRuntime::with_handler(Arc::new(
    |image: &str, mode: RunMode, mounts: &[Mount]| -> Result<(), ContainerError> {
      // Evaluate writes nothing.
      if mode == RunMode::Evaluate {
        return Ok(());
      }
      default_handler(image, mode, mounts)
    },
  ));
  let fx = Fixture::with_runtime(runtime);
  let perf = fx.workspace_root().join("perf");
  std::fs::create_dir_all(&perf).unwrap();
  std::fs::write(perf.join("performance.json"), br#"{"perf":0.99}"#).unwrap();

  let err = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert_eq!(err.stage(), Stage::ParsePerf);
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}

#[tokio::test]
async fn test_unload_failure_does_not_fail_task() {
  let fx = Fixture::new();
  let algo_image = format!("algo-{}", fx.algo);
  fx.runtime.fail_unload(algo_image.clone());

  let outcome = fx
    .worker()
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap();

  assert_eq!(outcome.model, fx.model_end);
  let reports = fx.peer.reports();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].status, TaskStatus::Done);
  // The other image and the workspace are still released.
  assert_eq!(
    fx.runtime.loaded().into_iter().collect::<Vec<_>>(),
    vec![algo_image]
  );
  assert!(!fx.workspace_root().exists());
}

#[tokio::test]
async fn test_truncated_data_file_fails_staging() {
  let fx = Fixture::new();
  let swapped = fx.test[0];
  let store = SwappingStore {
    inner: fx.store.clone(),
    swapped,
    dest: fx
      .workspace_root()
      .join("test")
      .join(swapped.to_string()),
  };
  let worker = LearnWorker::new(
    fx.config(),
    Arc::new(store),
    Arc::new(fx.runtime.clone()),
    Arc::new(fx.peer.clone()),
  );

  let err = worker
    .handle_learn(&fx.worker_id, &fx.payload(0, None))
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    LearnError::Workflow {
      stage: Stage::StageData,
      ..
    }
  ));
  assert!(err.to_string().contains(&format!("data {}", swapped)));
  assert!(fx.runtime.runs().is_empty());
  assert_eq!(fx.peer.reports()[0].status, TaskStatus::Failed);
  fx.assert_released();
}
