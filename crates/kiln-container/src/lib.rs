//! Kiln Container
//!
//! The worker never runs learning code itself. Problem and algorithm images
//! are loaded into a container runtime and run against directories of the
//! task workspace mounted at fixed paths:
//!
//! ```text
//! mode       image     mounts
//! detarget   problem   test, untargeted_test
//! train      algo      train, untargeted_test, model
//! evaluate   problem   train, test, untargeted_test, model, perf
//! ```
//!
//! [`ContainerRuntime`] is the seam. [`DockerRuntime`] drives a real docker
//! daemon, [`MockRuntime`] is deterministic and in-memory for tests. Which
//! one a worker uses is decided once, from [`RuntimeBackend`].

mod docker;
mod mock;

pub use docker::{DockerConfig, DockerRuntime};
pub use mock::{
  MOCK_MODEL_FILE, MOCK_PERFORMANCE, MockHandler, MockRuntime, RuntimeCall, default_handler,
};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_artifact::ByteStream;

/// In-container path of the training set.
pub const TRAIN_TARGET: &str = "/data/train";
/// In-container path of the labelled test set.
pub const TEST_TARGET: &str = "/data/test";
/// In-container path of the test set with labels stripped.
pub const UNTARGETED_TEST_TARGET: &str = "/data/untargeted_test";
/// In-container path of the model directory.
pub const MODEL_TARGET: &str = "/data/model";
/// In-container path of the performance output directory.
pub const PERF_TARGET: &str = "/data/perf";

/// Errors raised by a container runtime.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
  /// An I/O error occurred talking to the runtime.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The image content stream failed while being loaded.
  #[error("image stream failed: {0}")]
  ImageStream(#[from] kiln_artifact::Error),

  /// A runtime command exited unsuccessfully.
  #[error("`{command}` exited with {status}: {stderr}")]
  CommandFailed {
    command: String,
    status: String,
    stderr: String,
  },

  /// The runtime answered with something we could not interpret.
  #[error("unexpected runtime output: {0}")]
  UnexpectedOutput(String),

  /// The image was never loaded (or already unloaded).
  #[error("image not loaded: {0}")]
  ImageNotLoaded(String),

  /// A container run failed.
  #[error("{mode} run of {image} failed: {message}")]
  Run {
    image: String,
    mode: RunMode,
    message: String,
  },
}

/// What a container is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
  /// Copy the test set with ground-truth labels stripped (problem image).
  Detarget,
  /// Train a model (algorithm image).
  Train,
  /// Compute performance metrics (problem image).
  Evaluate,
}

impl RunMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunMode::Detarget => "detarget",
      RunMode::Train => "train",
      RunMode::Evaluate => "perf",
    }
  }
}

impl fmt::Display for RunMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A host directory made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
  pub source: PathBuf,
  pub target: &'static str,
}

impl Mount {
  pub fn new(source: impl Into<PathBuf>, target: &'static str) -> Self {
    Self {
      source: source.into(),
      target,
    }
  }
}

/// Find the host path mounted at `target`.
pub fn mounted_at<'a>(mounts: &'a [Mount], target: &str) -> Option<&'a PathBuf> {
  mounts.iter().find(|m| m.target == target).map(|m| &m.source)
}

/// Container runtime trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
  /// Load an image from its tarball, making it runnable as `name`.
  async fn load(&self, name: &str, image: ByteStream) -> Result<(), ContainerError>;

  /// Remove the image known as `name`.
  async fn unload(&self, name: &str) -> Result<(), ContainerError>;

  /// Run `image` in `mode` against `mounts`, waiting for it to exit.
  ///
  /// Results are side effects on the mounted directories.
  async fn run(&self, image: &str, mode: RunMode, mounts: &[Mount]) -> Result<(), ContainerError>;
}

/// Which container runtime a worker uses.
#[derive(Debug, Clone)]
pub enum RuntimeBackend {
  Docker(DockerConfig),
  Mock,
}

impl RuntimeBackend {
  /// Build the configured runtime.
  pub fn build(self) -> Arc<dyn ContainerRuntime> {
    match self {
      RuntimeBackend::Docker(config) => Arc::new(DockerRuntime::new(config)),
      RuntimeBackend::Mock => Arc::new(MockRuntime::new()),
    }
  }
}
