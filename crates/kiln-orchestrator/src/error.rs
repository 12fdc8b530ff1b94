//! Learn pipeline errors.

use std::path::PathBuf;

use kiln_container::ContainerError;
use kiln_peer::PeerError;
use kiln_task::ValidationError;

use crate::stage::Stage;

/// A collaborator call that failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("storage: {0}")]
  Storage(#[from] kiln_artifact::Error),

  #[error("container runtime: {0}")]
  Container(#[from] ContainerError),

  #[error("peer: {0}")]
  Peer(#[from] PeerError),
}

/// Errors surfaced by [`LearnWorker::handle_learn`](crate::LearnWorker::handle_learn).
#[derive(Debug, thiserror::Error)]
pub enum LearnError {
  /// The payload was rejected before anything was claimed.
  #[error("invalid learn task: {0}")]
  Validation(#[from] ValidationError),

  /// A call to storage, the container runtime or the peer failed.
  #[error("{stage} failed on {target}: {source}")]
  Transport {
    stage: Stage,
    target: String,
    #[source]
    source: TransportError,
  },

  /// A stage's own work failed (filesystem, archive, unexpected output).
  #[error("{stage} failed: {message}")]
  Workflow { stage: Stage, message: String },

  /// The task failed and the failure could not be reported either.
  #[error("{cause}; reporting the failure also failed: {report}")]
  Reporting {
    cause: Box<LearnError>,
    #[source]
    report: PeerError,
  },
}

impl LearnError {
  /// Create a transport error.
  pub fn transport(
    stage: Stage,
    target: impl Into<String>,
    source: impl Into<TransportError>,
  ) -> Self {
    Self::Transport {
      stage,
      target: target.into(),
      source: source.into(),
    }
  }

  /// Create a workflow error.
  pub fn workflow(stage: Stage, message: impl Into<String>) -> Self {
    Self::Workflow {
      stage,
      message: message.into(),
    }
  }

  /// The stage the error originated in.
  pub fn stage(&self) -> Stage {
    match self {
      LearnError::Validation(_) => Stage::Decode,
      LearnError::Transport { stage, .. } | LearnError::Workflow { stage, .. } => *stage,
      LearnError::Reporting { cause, .. } => cause.stage(),
    }
  }
}

/// Failures while releasing task resources. Logged, never surfaced.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
  #[error("failed to remove workspace {}: {source}", path.display())]
  Workspace {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to unload image {image}: {source}")]
  Unload {
    image: String,
    #[source]
    source: ContainerError,
  },
}
