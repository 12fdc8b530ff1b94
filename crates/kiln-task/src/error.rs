//! Validation errors.

/// Errors raised while decoding or checking a learn task payload.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
  /// The payload is not a valid learn task document.
  #[error("malformed learn task: {message}")]
  Malformed { message: String },

  /// The task key is empty.
  #[error("task key is empty")]
  EmptyKey,

  /// A required identifier is the nil UUID.
  #[error("field '{field}' must not be nil")]
  NilId { field: &'static str },

  /// A data set is empty.
  #[error("field '{field}' must contain at least one data id")]
  EmptyDataSet { field: &'static str },

  /// A task with a positive rank has no seed model.
  #[error("rank {rank} requires model_start to be set")]
  MissingModelStart { rank: u32 },
}

impl ValidationError {
  /// Create a malformed payload error.
  pub fn malformed(message: impl Into<String>) -> Self {
    Self::Malformed {
      message: message.into(),
    }
  }
}
