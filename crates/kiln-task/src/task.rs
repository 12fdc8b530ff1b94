use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Status of a learn task as recorded by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  /// Waiting for, or being processed by, a worker. Older producers spell it `todo`.
  #[serde(alias = "todo")]
  Pending,
  Done,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Done => "done",
      TaskStatus::Failed => "failed",
    }
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A learning task: train an algorithm on a problem's data and evaluate it.
///
/// Immutable once received. `rank` is the model generation: `0` trains from
/// scratch, anything above resumes from `model_start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnTask {
  pub key: String,
  pub problem: Uuid,
  pub algo: Uuid,
  pub train_data: Vec<Uuid>,
  pub test_data: Vec<Uuid>,
  #[serde(default)]
  pub model_start: Option<Uuid>,
  pub model_end: Uuid,
  #[serde(default)]
  pub rank: u32,
  #[serde(default)]
  pub worker: Option<Uuid>,
  #[serde(default = "default_status")]
  pub status: TaskStatus,
  #[serde(default)]
  pub request_date: i64,
  #[serde(default)]
  pub completion_date: i64,
}

fn default_status() -> TaskStatus {
  TaskStatus::Pending
}

impl LearnTask {
  /// Decode a raw queue payload and validate it.
  pub fn decode(payload: &[u8]) -> Result<Self, ValidationError> {
    let task: LearnTask =
      serde_json::from_slice(payload).map_err(|e| ValidationError::malformed(e.to_string()))?;
    task.check()?;
    Ok(task)
  }

  /// Check the task's structural invariants.
  pub fn check(&self) -> Result<(), ValidationError> {
    if self.key.trim().is_empty() {
      return Err(ValidationError::EmptyKey);
    }

    for (field, id) in [
      ("problem", self.problem),
      ("algo", self.algo),
      ("model_end", self.model_end),
    ] {
      if id.is_nil() {
        return Err(ValidationError::NilId { field });
      }
    }

    if self.train_data.is_empty() {
      return Err(ValidationError::EmptyDataSet {
        field: "train_data",
      });
    }
    if self.test_data.is_empty() {
      return Err(ValidationError::EmptyDataSet { field: "test_data" });
    }

    if self.rank > 0 && self.start_model_id().is_none() {
      return Err(ValidationError::MissingModelStart { rank: self.rank });
    }

    Ok(())
  }

  /// The model to resume from, if this task resumes at all.
  ///
  /// Always `None` for a first generation task, whatever `model_start` says.
  pub fn seed_model(&self) -> Option<Uuid> {
    if self.rank == 0 {
      return None;
    }
    self.start_model_id()
  }

  // A nil UUID counts as unset.
  fn start_model_id(&self) -> Option<Uuid> {
    self.model_start.filter(|id| !id.is_nil())
  }
}
