//! Kiln Artifact
//!
//! This crate provides the artifact storage trait and implementations for kiln.
//! Artifacts are the binary blobs a learn task needs or produces: problem
//! workflow images, algorithm images, data sets and trained models.
//!
//! The [`ArtifactStore`] trait is the worker's view of object storage.
//! Implementations handle the actual backend (local filesystem, the HTTP
//! storage service, or memory for tests) while the orchestrator only deals
//! in artifact kinds and ids.
//!
//! The trait uses async streaming for efficient handling of large files.

mod fs;
mod http;
mod memory;

pub use fs::FsArtifactStore;
pub use http::HttpArtifactStore;
pub use memory::{MemoryArtifactStore, StoredModel};

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A boxed stream of bytes for artifact data.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// Error type for artifact storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested artifact was not found.
  #[error("{kind} {id} not found")]
  NotFound { kind: ArtifactKind, id: Uuid },

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The HTTP request could not be completed.
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  /// The storage service answered with a non-success status.
  #[error("storage returned {status} for {url}")]
  Status { status: u16, url: String },

  /// An upload did not carry the number of bytes it announced.
  #[error("size mismatch: expected {expected} bytes, got {actual}")]
  SizeMismatch { expected: u64, actual: u64 },

  /// Artifact metadata could not be read or written.
  #[error("invalid metadata: {0}")]
  Metadata(String),
}

/// The kinds of artifact the worker deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
  /// A problem workflow image (detargeting and evaluation).
  Problem,
  /// An algorithm image (training).
  Algo,
  /// A trained model archive.
  Model,
  /// A data set.
  Data,
}

impl ArtifactKind {
  /// Path segment used by storage backends.
  pub fn as_str(&self) -> &'static str {
    match self {
      ArtifactKind::Problem => "problem",
      ArtifactKind::Algo => "algo",
      ArtifactKind::Model => "model",
      ArtifactKind::Data => "data",
    }
  }
}

impl fmt::Display for ArtifactKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Descriptive record kept next to an artifact blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
  pub id: Uuid,
  #[serde(default)]
  pub name: String,
  /// For models, the algorithm that produced them.
  #[serde(default)]
  pub algo: Option<Uuid>,
}

/// Identity of a model being uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRecord {
  pub id: Uuid,
  pub algo: Uuid,
}

impl From<ModelRecord> for ArtifactMetadata {
  fn from(model: ModelRecord) -> Self {
    Self {
      id: model.id,
      name: format!("model-{}", model.id),
      algo: Some(model.algo),
    }
  }
}

/// Artifact storage trait.
///
/// Implementations provide the actual storage backend (filesystem, HTTP, etc.).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
  /// Retrieve an artifact's content.
  ///
  /// Returns a stream of bytes for efficient handling of large files.
  async fn fetch(&self, kind: ArtifactKind, id: Uuid) -> Result<ByteStream, Error>;

  /// Retrieve an artifact's metadata record.
  async fn fetch_metadata(&self, kind: ArtifactKind, id: Uuid) -> Result<ArtifactMetadata, Error>;

  /// Store a trained model.
  ///
  /// `size` is the exact number of bytes `data` will yield.
  async fn store_model(
    &self,
    model: &ModelRecord,
    data: ByteStream,
    size: u64,
  ) -> Result<(), Error>;
}
