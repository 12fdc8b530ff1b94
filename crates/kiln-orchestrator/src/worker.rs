//! The learn workflow.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use kiln_artifact::{ArtifactKind, ArtifactStore, ModelRecord};
use kiln_container::{
  ContainerRuntime, MODEL_TARGET, Mount, PERF_TARGET, RunMode, TEST_TARGET, TRAIN_TARGET,
  UNTARGETED_TEST_TARGET,
};
use kiln_peer::StatusReporter;
use kiln_task::{LearnTask, PerformanceRecord, TaskStatus, WorkerId};
use tracing::{Span, error, info, instrument, warn};
use uuid::Uuid;

use crate::archive;
use crate::config::WorkerConfig;
use crate::error::LearnError;
use crate::events::{LearnEvent, LearnNotifier, NoopNotifier};
use crate::images::ImageSet;
use crate::stage::Stage;
use crate::transfer::{self, TransferError};
use crate::workspace::Workspace;

/// Result of a successful learn task.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnOutcome {
  pub task_key: String,
  /// Id the trained model was stored under.
  pub model: Uuid,
  pub performance: PerformanceRecord,
}

/// Runs learn tasks against a set of collaborators.
///
/// Generic over `N: LearnNotifier` to allow different notification strategies.
/// Use `LearnWorker::new()` for a worker with no-op notifications, or
/// `LearnWorker::with_notifier()` to observe stage transitions.
///
/// The worker holds no identity of its own; callers pass it into every
/// [`handle_learn`](Self::handle_learn) call.
pub struct LearnWorker<N: LearnNotifier = NoopNotifier> {
  config: WorkerConfig,
  store: Arc<dyn ArtifactStore>,
  runtime: Arc<dyn ContainerRuntime>,
  peer: Arc<dyn StatusReporter>,
  notifier: N,
}

impl LearnWorker<NoopNotifier> {
  /// Create a worker with no-op notifications.
  pub fn new(
    config: WorkerConfig,
    store: Arc<dyn ArtifactStore>,
    runtime: Arc<dyn ContainerRuntime>,
    peer: Arc<dyn StatusReporter>,
  ) -> Self {
    Self::with_notifier(config, store, runtime, peer, NoopNotifier)
  }
}

impl<N: LearnNotifier> LearnWorker<N> {
  /// Create a worker with a custom notifier.
  pub fn with_notifier(
    config: WorkerConfig,
    store: Arc<dyn ArtifactStore>,
    runtime: Arc<dyn ContainerRuntime>,
    peer: Arc<dyn StatusReporter>,
    notifier: N,
  ) -> Self {
    Self {
      config,
      store,
      runtime,
      peer,
      notifier,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// Process one learn task payload end to end.
  ///
  /// Nothing is touched until the payload validates. Once the task is
  /// claimed, any failure is reported to the peer as `failed`, and the
  /// workspace and images are released whatever the outcome.
  #[instrument(
    name = "learn",
    skip(self, worker, payload),
    fields(worker = %worker, task_key = tracing::field::Empty)
  )]
  pub async fn handle_learn(
    &self,
    worker: &WorkerId,
    payload: &[u8],
  ) -> Result<LearnOutcome, LearnError> {
    let task = LearnTask::decode(payload).map_err(|e| {
      error!(error = %e, payload = %String::from_utf8_lossy(payload), "rejecting learn task");
      LearnError::from(e)
    })?;

    Span::current().record("task_key", task.key.as_str());
    info!(
      problem = %task.problem,
      algo = %task.algo,
      rank = task.rank,
      train_sets = task.train_data.len(),
      test_sets = task.test_data.len(),
      "learn task started"
    );
    self.notifier.notify(LearnEvent::TaskReceived {
      task_key: task.key.clone(),
    });

    let result = self.claim_and_run(worker, &task).await;

    match &result {
      Ok(outcome) => {
        info!(model = %outcome.model, perf = outcome.performance.perf, "learn task done");
        self.notifier.notify(LearnEvent::TaskSucceeded {
          task_key: task.key.clone(),
        });
      }
      Err(e) => {
        error!(error = %e, stage = %e.stage(), "learn task failed");
        self.notifier.notify(LearnEvent::TaskFailed {
          task_key: task.key.clone(),
          error: e.to_string(),
        });
      }
    }

    result
  }

  async fn claim_and_run(
    &self,
    worker: &WorkerId,
    task: &LearnTask,
  ) -> Result<LearnOutcome, LearnError> {
    // Nothing is held yet, so a failed claim is neither reported nor cleaned up.
    self
      .step(task, Stage::Claim, async {
        self
          .peer
          .claim(&task.key, worker)
          .await
          .map_err(|e| LearnError::transport(Stage::Claim, format!("task {}", task.key), e))
      })
      .await?;

    let workspace = match self
      .step(task, Stage::PrepareWorkspace, self.prepare_workspace(task))
      .await
    {
      Ok(workspace) => workspace,
      Err(e) => return Err(self.report_failure(task, e).await),
    };

    let mut images = ImageSet::new(self.runtime.clone());
    let result = match self.run_pipeline(task, &workspace, &mut images).await {
      Ok(performance) => self.report_success(task, performance).await,
      Err(e) => Err(self.report_failure(task, e).await),
    };

    self.cleanup(task, images, workspace).await;
    result
  }

  /// Everything between workspace creation and reporting.
  async fn run_pipeline(
    &self,
    task: &LearnTask,
    workspace: &Workspace,
    images: &mut ImageSet,
  ) -> Result<PerformanceRecord, LearnError> {
    let problem_image = self.config.problem_image(task.problem);
    let algo_image = self.config.algo_image(task.algo);

    self
      .step(task, Stage::LoadImages, self.load_images(task, images))
      .await?;

    self
      .step(task, Stage::StageData, self.stage_data(task, workspace))
      .await?;

    if let Some(model_start) = task.seed_model() {
      self
        .step(
          task,
          Stage::SeedModel,
          self.seed_model(task, model_start, workspace),
        )
        .await?;
    }

    self
      .step(
        task,
        Stage::UntargetTestData,
        self.run_container(
          Stage::UntargetTestData,
          &problem_image,
          RunMode::Detarget,
          vec![
            Mount::new(workspace.test(), TEST_TARGET),
            Mount::new(workspace.untargeted_test(), UNTARGETED_TEST_TARGET),
          ],
        ),
      )
      .await?;

    self
      .step(
        task,
        Stage::Train,
        self.run_container(
          Stage::Train,
          &algo_image,
          RunMode::Train,
          vec![
            Mount::new(workspace.train(), TRAIN_TARGET),
            Mount::new(workspace.untargeted_test(), UNTARGETED_TEST_TARGET),
            Mount::new(workspace.model(), MODEL_TARGET),
          ],
        ),
      )
      .await?;

    self
      .step(
        task,
        Stage::ComputePerf,
        self.run_container(
          Stage::ComputePerf,
          &problem_image,
          RunMode::Evaluate,
          vec![
            Mount::new(workspace.train(), TRAIN_TARGET),
            Mount::new(workspace.test(), TEST_TARGET),
            Mount::new(workspace.untargeted_test(), UNTARGETED_TEST_TARGET),
            Mount::new(workspace.model(), MODEL_TARGET),
            Mount::new(workspace.perf(), PERF_TARGET),
          ],
        ),
      )
      .await?;

    self
      .step(task, Stage::PackageModel, self.package_model(task, workspace))
      .await?;

    self
      .step(task, Stage::ParsePerf, self.parse_perf(workspace))
      .await
  }

  /// Run `work` as `stage`, emitting the stage's events.
  async fn step<T, E: fmt::Display>(
    &self,
    task: &LearnTask,
    stage: Stage,
    work: impl Future<Output = Result<T, E>>,
  ) -> Result<T, E> {
    info!(stage = %stage, "stage started");
    self.notifier.notify(LearnEvent::StageStarted {
      task_key: task.key.clone(),
      stage,
    });

    let result = work.await;

    match &result {
      Ok(_) => {
        info!(stage = %stage, "stage completed");
        self.notifier.notify(LearnEvent::StageCompleted {
          task_key: task.key.clone(),
          stage,
        });
      }
      Err(e) => {
        self.notifier.notify(LearnEvent::StageFailed {
          task_key: task.key.clone(),
          stage,
          error: e.to_string(),
        });
      }
    }

    result
  }

  async fn prepare_workspace(&self, task: &LearnTask) -> Result<Workspace, LearnError> {
    Workspace::create(&self.config.data_dir, task.algo)
      .await
      .map_err(|e| {
        LearnError::workflow(
          Stage::PrepareWorkspace,
          format!(
            "creating workspace under {}: {}",
            self.config.data_dir.display(),
            e
          ),
        )
      })
  }

  /// Fetch and load the problem and algorithm images.
  ///
  /// Image names depend only on the problem/algo ids, so two tasks sharing
  /// one on the same worker load and unload the same name. There is no
  /// reference counting yet.
  async fn load_images(&self, task: &LearnTask, images: &mut ImageSet) -> Result<(), LearnError> {
    let wanted = [
      (
        ArtifactKind::Problem,
        task.problem,
        self.config.problem_image(task.problem),
      ),
      (
        ArtifactKind::Algo,
        task.algo,
        self.config.algo_image(task.algo),
      ),
    ];

    for (kind, id, name) in wanted {
      let blob = self
        .store
        .fetch(kind, id)
        .await
        .map_err(|e| LearnError::transport(Stage::LoadImages, format!("{} {}", kind, id), e))?;

      images
        .load(&name, blob)
        .await
        .map_err(|e| LearnError::transport(Stage::LoadImages, format!("image {}", name), e))?;
    }

    Ok(())
  }

  /// Download every train and test data set into the workspace.
  async fn stage_data(&self, task: &LearnTask, workspace: &Workspace) -> Result<(), LearnError> {
    let train_dir = workspace.train();
    let test_dir = workspace.test();

    let items = task
      .train_data
      .iter()
      .map(|id| (*id, train_dir.join(id.to_string())))
      .chain(
        task
          .test_data
          .iter()
          .map(|id| (*id, test_dir.join(id.to_string()))),
      );

    let written: Vec<u64> = futures::stream::iter(items)
      .map(|(id, dest)| self.stage_item(id, dest))
      .buffered(self.config.staging_concurrency.max(1))
      .try_collect()
      .await?;

    info!(
      data_sets = written.len(),
      bytes = written.iter().sum::<u64>(),
      "data staged"
    );
    Ok(())
  }

  async fn stage_item(&self, id: Uuid, dest: PathBuf) -> Result<u64, LearnError> {
    let target = format!("data {}", id);
    let data = self
      .store
      .fetch(ArtifactKind::Data, id)
      .await
      .map_err(|e| LearnError::transport(Stage::StageData, &target, e))?;

    transfer::stream_to_file(data, &dest)
      .await
      .map_err(|e| match e {
        TransferError::Stream(e) => LearnError::transport(Stage::StageData, &target, e),
        other => LearnError::workflow(Stage::StageData, format!("{}: {}", target, other)),
      })
  }

  /// Unpack the model this task resumes from into the model directory.
  async fn seed_model(
    &self,
    task: &LearnTask,
    model_start: Uuid,
    workspace: &Workspace,
  ) -> Result<(), LearnError> {
    let target = format!("model {}", model_start);

    let metadata = self
      .store
      .fetch_metadata(ArtifactKind::Model, model_start)
      .await
      .map_err(|e| LearnError::transport(Stage::SeedModel, &target, e))?;
    if let Some(algo) = metadata.algo
      && algo != task.algo
    {
      return Err(LearnError::workflow(
        Stage::SeedModel,
        format!(
          "{} was trained by algo {}, task uses algo {}",
          target, algo, task.algo
        ),
      ));
    }

    let data = self
      .store
      .fetch(ArtifactKind::Model, model_start)
      .await
      .map_err(|e| LearnError::transport(Stage::SeedModel, &target, e))?;

    let archive_path = workspace.seed_archive();
    transfer::stream_to_file(data, &archive_path)
      .await
      .map_err(|e| match e {
        TransferError::Stream(e) => LearnError::transport(Stage::SeedModel, &target, e),
        other => LearnError::workflow(Stage::SeedModel, format!("{}: {}", target, other)),
      })?;

    archive::unpack(&archive_path, &workspace.model())
      .await
      .map_err(|e| {
        LearnError::workflow(Stage::SeedModel, format!("unpacking {}: {}", target, e))
      })?;

    tokio::fs::remove_file(&archive_path)
      .await
      .map_err(|e| LearnError::workflow(Stage::SeedModel, e.to_string()))
  }

  async fn run_container(
    &self,
    stage: Stage,
    image: &str,
    mode: RunMode,
    mounts: Vec<Mount>,
  ) -> Result<(), LearnError> {
    self
      .runtime
      .run(image, mode, &mounts)
      .await
      .map_err(|e| LearnError::transport(stage, format!("image {}", image), e))
  }

  /// Archive the model directory and upload it as `model_end`.
  async fn package_model(&self, task: &LearnTask, workspace: &Workspace) -> Result<(), LearnError> {
    let archive_path = workspace.model_archive();

    archive::pack_dir(&workspace.model(), &archive_path)
      .await
      .map_err(|e| LearnError::workflow(Stage::PackageModel, format!("archiving model: {}", e)))?;

    let (data, size) = transfer::file_stream(&archive_path).await.map_err(|e| {
      LearnError::workflow(Stage::PackageModel, format!("reopening archive: {}", e))
    })?;

    let record = ModelRecord {
      id: task.model_end,
      algo: task.algo,
    };
    info!(model = %record.id, size, "uploading model");

    self
      .store
      .store_model(&record, data, size)
      .await
      .map_err(|e| LearnError::transport(Stage::PackageModel, format!("model {}", record.id), e))
  }

  async fn parse_perf(&self, workspace: &Workspace) -> Result<PerformanceRecord, LearnError> {
    let path = workspace.performance_file();
    let content = tokio::fs::read(&path).await.map_err(|e| {
      LearnError::workflow(
        Stage::ParsePerf,
        format!("reading {}: {}", path.display(), e),
      )
    })?;

    PerformanceRecord::from_slice(&content).map_err(|e| {
      LearnError::workflow(
        Stage::ParsePerf,
        format!("invalid performance file: {}", e),
      )
    })
  }

  async fn report_success(
    &self,
    task: &LearnTask,
    performance: PerformanceRecord,
  ) -> Result<LearnOutcome, LearnError> {
    self
      .step(task, Stage::Report, async {
        self
          .peer
          .report_learn(&task.key, TaskStatus::Done, &performance)
          .await
          .map_err(|e| LearnError::transport(Stage::Report, format!("task {}", task.key), e))
      })
      .await?;

    Ok(LearnOutcome {
      task_key: task.key.clone(),
      model: task.model_end,
      performance,
    })
  }

  /// Report the task as failed, returning the error to surface.
  ///
  /// Every failure is treated as fatal for the task. Telling transient
  /// failures apart (and leaving those tasks pending for redelivery) would
  /// hook in here.
  async fn report_failure(&self, task: &LearnTask, cause: LearnError) -> LearnError {
    warn!(error = %cause, stage = %cause.stage(), "reporting task as failed");

    let reported = self
      .step(
        task,
        Stage::Report,
        self
          .peer
          .report_learn(&task.key, TaskStatus::Failed, &PerformanceRecord::empty()),
      )
      .await;

    match reported {
      Ok(()) => cause,
      Err(report) => LearnError::Reporting {
        cause: Box::new(cause),
        report,
      },
    }
  }

  /// Release images and workspace. Failures are logged only.
  async fn cleanup(&self, task: &LearnTask, images: ImageSet, workspace: Workspace) {
    self.notifier.notify(LearnEvent::StageStarted {
      task_key: task.key.clone(),
      stage: Stage::Cleanup,
    });

    for e in images.release().await {
      warn!(error = %e, "cleanup failed");
    }
    if let Err(e) = workspace.remove().await {
      warn!(error = %e, "cleanup failed");
    }

    self.notifier.notify(LearnEvent::StageCompleted {
      task_key: task.key.clone(),
      stage: Stage::Cleanup,
    });
  }
}
