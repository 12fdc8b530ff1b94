use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::{ArtifactKind, ArtifactMetadata, ArtifactStore, ByteStream, Error, ModelRecord};

/// Filesystem-based artifact store.
///
/// Stores artifacts as files on the local filesystem:
/// ```text
/// {root}/
/// └── {kind}/
///     ├── {id}         blob
///     └── {id}.json    metadata
/// ```
/// Parent directories are created automatically.
pub struct FsArtifactStore {
  root: PathBuf,
}

impl FsArtifactStore {
  /// Create a new filesystem store with the given root path.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn blob_path(&self, kind: ArtifactKind, id: Uuid) -> PathBuf {
    self.root.join(kind.as_str()).join(id.to_string())
  }

  fn metadata_path(&self, kind: ArtifactKind, id: Uuid) -> PathBuf {
    self.root.join(kind.as_str()).join(format!("{}.json", id))
  }

  /// Write a blob and its metadata. Returns the number of bytes written.
  pub async fn put(
    &self,
    kind: ArtifactKind,
    metadata: &ArtifactMetadata,
    data: ByteStream,
  ) -> Result<u64, Error> {
    let path = self.blob_path(kind, metadata.id);

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(&path).await?;
    let mut stream = std::pin::pin!(data);
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
      let bytes = chunk?;
      file.write_all(&bytes).await?;
      written += bytes.len() as u64;
    }

    file.flush().await?;

    let encoded =
      serde_json::to_vec_pretty(metadata).map_err(|e| Error::Metadata(e.to_string()))?;
    fs::write(self.metadata_path(kind, metadata.id), encoded).await?;

    Ok(written)
  }

  fn not_found(kind: ArtifactKind, id: Uuid) -> impl FnOnce(std::io::Error) -> Error {
    move |e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound { kind, id }
      } else {
        Error::Io(e)
      }
    }
  }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
  async fn fetch(&self, kind: ArtifactKind, id: Uuid) -> Result<ByteStream, Error> {
    let path = self.blob_path(kind, id);
    let file = File::open(&path)
      .await
      .map_err(Self::not_found(kind, id))?;
    let stream = ReaderStream::new(file).map(|r| r.map_err(Error::Io));
    Ok(Box::pin(stream))
  }

  async fn fetch_metadata(&self, kind: ArtifactKind, id: Uuid) -> Result<ArtifactMetadata, Error> {
    let content = fs::read(self.metadata_path(kind, id))
      .await
      .map_err(Self::not_found(kind, id))?;
    serde_json::from_slice(&content).map_err(|e| Error::Metadata(e.to_string()))
  }

  async fn store_model(
    &self,
    model: &ModelRecord,
    data: ByteStream,
    size: u64,
  ) -> Result<(), Error> {
    let metadata = ArtifactMetadata::from(*model);
    let written = self.put(ArtifactKind::Model, &metadata, data).await?;

    if written != size {
      // Leave nothing half-stored behind.
      let _ = fs::remove_file(self.blob_path(ArtifactKind::Model, model.id)).await;
      let _ = fs::remove_file(self.metadata_path(ArtifactKind::Model, model.id)).await;
      return Err(Error::SizeMismatch {
        expected: size,
        actual: written,
      });
    }

    Ok(())
  }
}
