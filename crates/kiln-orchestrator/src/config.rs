use std::path::PathBuf;

use uuid::Uuid;

/// Configuration for a learn worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Base directory under which task workspaces are created.
  pub data_dir: PathBuf,
  /// Prefix of the name problem images are loaded under.
  pub problem_image_prefix: String,
  /// Prefix of the name algorithm images are loaded under.
  pub algo_image_prefix: String,
  /// How many data sets are fetched at once while staging. Order and
  /// per-item integrity checks hold for any value.
  pub staging_concurrency: usize,
}

impl WorkerConfig {
  /// Configuration with default prefixes and sequential staging.
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: data_dir.into(),
      problem_image_prefix: "problem-".to_string(),
      algo_image_prefix: "algo-".to_string(),
      staging_concurrency: 1,
    }
  }

  /// Name the problem image `problem` is loaded under.
  pub fn problem_image(&self, problem: Uuid) -> String {
    format!("{}{}", self.problem_image_prefix, problem)
  }

  /// Name the algorithm image `algo` is loaded under.
  pub fn algo_image(&self, algo: Uuid) -> String {
    format!("{}{}", self.algo_image_prefix, algo)
  }
}
