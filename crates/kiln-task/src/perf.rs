use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Contents of the `performance.json` file written by the evaluation run.
///
/// Values are carried to the peer exactly as decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
  pub perf: f64,
  #[serde(default)]
  pub train_perf: HashMap<String, f64>,
  #[serde(default)]
  pub test_perf: HashMap<String, f64>,
}

impl PerformanceRecord {
  /// The record attached to failure reports.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Parse a performance descriptor.
  pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }
}
