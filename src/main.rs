use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kiln_artifact::{ArtifactStore, FsArtifactStore, HttpArtifactStore};
use kiln_container::{DockerConfig, RuntimeBackend};
use kiln_orchestrator::{LearnOutcome, LearnWorker, WorkerConfig};
use kiln_peer::{HttpPeer, MockPeer, StatusReporter};
use kiln_task::WorkerId;

/// Kiln - a compute worker for learning tasks
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Base directory for task workspaces (default: ~/.kiln/data)
  #[arg(long, global = true, env = "KILN_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// Worker identity reported when claiming tasks (default: random)
  #[arg(long, global = true, env = "KILN_WORKER_ID")]
  worker_id: Option<WorkerId>,

  #[arg(long, global = true, env = "KILN_PROBLEM_IMAGE_PREFIX", default_value = "problem-")]
  problem_image_prefix: String,

  #[arg(long, global = true, env = "KILN_ALGO_IMAGE_PREFIX", default_value = "algo-")]
  algo_image_prefix: String,

  /// Number of data sets downloaded at once
  #[arg(long, global = true, env = "KILN_STAGING_CONCURRENCY", default_value_t = 1)]
  staging_concurrency: usize,

  /// Container runtime used for learning containers
  #[arg(long, global = true, env = "KILN_RUNTIME", value_enum, default_value_t = RuntimeKind::Docker)]
  runtime: RuntimeKind,

  /// Docker CLI binary
  #[arg(long, global = true, env = "KILN_DOCKER_BIN", default_value = "docker")]
  docker_bin: PathBuf,

  /// Base URL of the storage service. Takes precedence over --storage-dir.
  #[arg(long, global = true, env = "KILN_STORAGE_URL")]
  storage_url: Option<String>,

  /// Local artifact directory (default: ~/.kiln/storage)
  #[arg(long, global = true, env = "KILN_STORAGE_DIR")]
  storage_dir: Option<PathBuf>,

  /// Base URL of the peer. Without it, outcomes are only logged.
  #[arg(long, global = true, env = "KILN_PEER_URL")]
  peer_url: Option<String>,

  /// Timeout for storage and peer requests
  #[arg(long, global = true, env = "KILN_HTTP_TIMEOUT_SECS")]
  http_timeout_secs: Option<u64>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RuntimeKind {
  Docker,
  Mock,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a single learn task
  Learn {
    /// The task payload as JSON, or `-` to read it from stdin
    payload: String,
  },

  /// Run learn tasks read from stdin, one JSON payload per line
  Consume,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let Some(command) = cli.command.as_ref() else {
    println!("kiln - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  match command {
    Commands::Learn { payload } => {
      let payload = read_payload(payload)?;
      rt.block_on(async { run_learn(&cli, payload).await })
    }
    Commands::Consume => rt.block_on(async { run_consume(&cli).await }),
  }
}

fn kiln_home() -> Result<PathBuf> {
  dirs::home_dir()
    .map(|home| home.join(".kiln"))
    .context("could not determine home directory")
}

fn build_worker(cli: &Cli) -> Result<LearnWorker> {
  let data_dir = match &cli.data_dir {
    Some(dir) => dir.clone(),
    None => kiln_home()?.join("data"),
  };
  let timeout = cli.http_timeout_secs.map(Duration::from_secs);

  let store: Arc<dyn ArtifactStore> = match (&cli.storage_url, &cli.storage_dir) {
    (Some(url), _) => Arc::new(
      HttpArtifactStore::new(url.clone(), timeout).context("failed to create storage client")?,
    ),
    (None, Some(dir)) => Arc::new(FsArtifactStore::new(dir)),
    (None, None) => Arc::new(FsArtifactStore::new(kiln_home()?.join("storage"))),
  };

  let runtime = match cli.runtime {
    RuntimeKind::Docker => RuntimeBackend::Docker(DockerConfig {
      binary: cli.docker_bin.clone(),
      ..DockerConfig::default()
    }),
    RuntimeKind::Mock => RuntimeBackend::Mock,
  }
  .build();

  let peer: Arc<dyn StatusReporter> = match &cli.peer_url {
    Some(url) => {
      Arc::new(HttpPeer::new(url.clone(), timeout).context("failed to create peer client")?)
    }
    None => {
      warn!("no peer configured, task outcomes are only logged");
      Arc::new(MockPeer::new())
    }
  };

  let config = WorkerConfig {
    problem_image_prefix: cli.problem_image_prefix.clone(),
    algo_image_prefix: cli.algo_image_prefix.clone(),
    staging_concurrency: cli.staging_concurrency,
    ..WorkerConfig::new(data_dir)
  };
  std::fs::create_dir_all(&config.data_dir)
    .with_context(|| format!("failed to create data dir: {}", config.data_dir.display()))?;

  Ok(LearnWorker::new(config, store, runtime, peer))
}

fn worker_id(cli: &Cli) -> WorkerId {
  let id = cli.worker_id.unwrap_or_else(WorkerId::generate);
  info!(worker = %id, "worker identity");
  id
}

async fn run_learn(cli: &Cli, payload: Vec<u8>) -> Result<()> {
  let worker = build_worker(cli)?;
  let id = worker_id(cli);

  let outcome = worker
    .handle_learn(&id, &payload)
    .await
    .context("learn task failed")?;
  print_outcome(&outcome);

  Ok(())
}

async fn run_consume(cli: &Cli) -> Result<()> {
  let worker = build_worker(cli)?;
  let id = worker_id(cli);

  // Tasks run one at a time; a failed task never stops the loop.
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines
    .next_line()
    .await
    .context("failed to read payload from stdin")?
  {
    if line.trim().is_empty() {
      continue;
    }

    match worker.handle_learn(&id, line.as_bytes()).await {
      Ok(outcome) => print_outcome(&outcome),
      Err(e) => error!(error = %e, stage = %e.stage(), "task abandoned"),
    }
  }

  info!("input closed, stopping");
  Ok(())
}

fn print_outcome(outcome: &LearnOutcome) {
  println!(
    "{} done: model {} perf {}",
    outcome.task_key, outcome.model, outcome.performance.perf
  );
}

fn read_payload(arg: &str) -> Result<Vec<u8>> {
  if arg != "-" {
    return Ok(arg.as_bytes().to_vec());
  }

  let mut input = Vec::new();
  io::stdin()
    .read_to_end(&mut input)
    .context("failed to read payload from stdin")?;
  Ok(input)
}
