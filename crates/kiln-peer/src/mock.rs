use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kiln_task::{PerformanceRecord, TaskStatus, WorkerId};
use tracing::info;

use crate::{PeerError, StatusReporter};

/// An outcome received by [`MockPeer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
  pub task_key: String,
  pub status: TaskStatus,
  pub performance: PerformanceRecord,
}

#[derive(Default)]
struct State {
  claims: Vec<(String, WorkerId)>,
  reports: Vec<Report>,
  fail_claims: bool,
  failing_statuses: Vec<TaskStatus>,
}

/// In-memory peer that records claims and reports.
///
/// Cloning shares state.
#[derive(Clone, Default)]
pub struct MockPeer {
  state: Arc<Mutex<State>>,
}

impl MockPeer {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Reject every claim.
  pub fn fail_claims(&self) {
    self.state().fail_claims = true;
  }

  /// Reject every report carrying `status`.
  pub fn fail_reports(&self, status: TaskStatus) {
    self.state().failing_statuses.push(status);
  }

  /// Claims received, in order.
  pub fn claims(&self) -> Vec<(String, WorkerId)> {
    self.state().claims.clone()
  }

  /// Reports received (including rejected ones), in order.
  pub fn reports(&self) -> Vec<Report> {
    self.state().reports.clone()
  }

  /// Total number of calls.
  pub fn call_count(&self) -> usize {
    let state = self.state();
    state.claims.len() + state.reports.len()
  }
}

#[async_trait]
impl StatusReporter for MockPeer {
  async fn claim(&self, task_key: &str, worker: &WorkerId) -> Result<(), PeerError> {
    let mut state = self.state();
    state.claims.push((task_key.to_string(), *worker));
    if state.fail_claims {
      return Err(PeerError::Rejected(format!("claim of {} refused", task_key)));
    }
    Ok(())
  }

  async fn report_learn(
    &self,
    task_key: &str,
    status: TaskStatus,
    performance: &PerformanceRecord,
  ) -> Result<(), PeerError> {
    let mut state = self.state();
    state.reports.push(Report {
      task_key: task_key.to_string(),
      status,
      performance: performance.clone(),
    });
    if state.failing_statuses.contains(&status) {
      return Err(PeerError::Rejected(format!(
        "{} report for {} refused",
        status, task_key
      )));
    }
    info!(task_key, status = %status, perf = performance.perf, "outcome recorded");
    Ok(())
  }
}
