//! Kiln Peer
//!
//! The peer is the authority that records which worker holds a learn task
//! and how the task ended. A claim is advisory bookkeeping: nothing stops a
//! second worker from claiming the same key.

mod http;
mod mock;

pub use http::HttpPeer;
pub use mock::{MockPeer, Report};

use async_trait::async_trait;
use kiln_task::{PerformanceRecord, TaskStatus, WorkerId};

/// Errors raised while talking to the peer.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
  /// The HTTP request could not be completed.
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// The peer answered with a non-success status.
  #[error("peer returned {status} for {url}: {body}")]
  Status {
    status: u16,
    url: String,
    body: String,
  },

  /// The configured base URL cannot carry task routes.
  #[error("invalid peer url: {0}")]
  InvalidUrl(String),

  /// The peer refused the request.
  #[error("peer rejected request: {0}")]
  Rejected(String),
}

/// Status reporting trait.
#[async_trait]
pub trait StatusReporter: Send + Sync {
  /// Register `worker` as the holder of the task `task_key`.
  async fn claim(&self, task_key: &str, worker: &WorkerId) -> Result<(), PeerError>;

  /// Record the final outcome of a learn task.
  async fn report_learn(
    &self,
    task_key: &str,
    status: TaskStatus,
    performance: &PerformanceRecord,
  ) -> Result<(), PeerError>;
}
