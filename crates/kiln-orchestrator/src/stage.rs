//! Pipeline stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A step of the learn pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Decode,
  Claim,
  PrepareWorkspace,
  LoadImages,
  StageData,
  /// Only for tasks with a positive rank.
  SeedModel,
  UntargetTestData,
  Train,
  ComputePerf,
  PackageModel,
  ParsePerf,
  Report,
  Cleanup,
}

impl Stage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Decode => "decode",
      Stage::Claim => "claim",
      Stage::PrepareWorkspace => "prepare_workspace",
      Stage::LoadImages => "load_images",
      Stage::StageData => "stage_data",
      Stage::SeedModel => "seed_model",
      Stage::UntargetTestData => "untarget_test_data",
      Stage::Train => "train",
      Stage::ComputePerf => "compute_perf",
      Stage::PackageModel => "package_model",
      Stage::ParsePerf => "parse_perf",
      Stage::Report => "report",
      Stage::Cleanup => "cleanup",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
