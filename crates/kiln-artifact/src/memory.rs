use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use uuid::Uuid;

use crate::{ArtifactKind, ArtifactMetadata, ArtifactStore, ByteStream, Error, ModelRecord};

/// Chunk size used when replaying blobs as streams.
const CHUNK_SIZE: usize = 8 * 1024;

/// A model received through [`ArtifactStore::store_model`].
#[derive(Debug, Clone)]
pub struct StoredModel {
  pub record: ModelRecord,
  pub data: Bytes,
  pub declared_size: u64,
}

#[derive(Default)]
struct State {
  blobs: HashMap<(ArtifactKind, Uuid), Bytes>,
  metadata: HashMap<(ArtifactKind, Uuid), ArtifactMetadata>,
  models: Vec<StoredModel>,
  fetches: Vec<(ArtifactKind, Uuid)>,
  metadata_fetches: Vec<(ArtifactKind, Uuid)>,
  upload_attempts: usize,
  failing: HashSet<Uuid>,
  fail_uploads: bool,
}

/// In-memory artifact store.
///
/// Records every call so tests can assert on what the worker fetched and
/// uploaded. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
  state: Arc<Mutex<State>>,
}

impl MemoryArtifactStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    // A poisoned lock only means another test thread panicked mid-call.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Add a blob without metadata.
  pub fn insert(&self, kind: ArtifactKind, id: Uuid, data: impl Into<Bytes>) {
    self.state().blobs.insert((kind, id), data.into());
  }

  /// Add a metadata record.
  pub fn insert_metadata(&self, kind: ArtifactKind, metadata: ArtifactMetadata) {
    self.state().metadata.insert((kind, metadata.id), metadata);
  }

  /// Make every fetch of `id` fail with an I/O error.
  pub fn fail_fetch(&self, id: Uuid) {
    self.state().failing.insert(id);
  }

  /// Make every model upload fail.
  pub fn fail_uploads(&self) {
    self.state().fail_uploads = true;
  }

  /// Blob fetches, in call order.
  pub fn fetches(&self) -> Vec<(ArtifactKind, Uuid)> {
    self.state().fetches.clone()
  }

  /// Metadata fetches, in call order.
  pub fn metadata_fetches(&self) -> Vec<(ArtifactKind, Uuid)> {
    self.state().metadata_fetches.clone()
  }

  /// Models uploaded so far.
  pub fn stored_models(&self) -> Vec<StoredModel> {
    self.state().models.clone()
  }

  /// Number of `store_model` calls, successful or not.
  pub fn upload_attempts(&self) -> usize {
    self.state().upload_attempts
  }

  /// Total number of calls of any kind.
  pub fn call_count(&self) -> usize {
    let state = self.state();
    state.fetches.len() + state.metadata_fetches.len() + state.upload_attempts
  }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
  async fn fetch(&self, kind: ArtifactKind, id: Uuid) -> Result<ByteStream, Error> {
    let data = {
      let mut state = self.state();
      state.fetches.push((kind, id));
      if state.failing.contains(&id) {
        return Err(Error::Io(std::io::Error::other(format!(
          "injected failure fetching {} {}",
          kind, id
        ))));
      }
      state
        .blobs
        .get(&(kind, id))
        .cloned()
        .ok_or(Error::NotFound { kind, id })?
    };

    let chunks: Vec<Result<Bytes, Error>> = data
      .chunks(CHUNK_SIZE)
      .map(|c| Ok(Bytes::copy_from_slice(c)))
      .collect();
    Ok(Box::pin(futures::stream::iter(chunks)))
  }

  async fn fetch_metadata(&self, kind: ArtifactKind, id: Uuid) -> Result<ArtifactMetadata, Error> {
    let mut state = self.state();
    state.metadata_fetches.push((kind, id));
    state
      .metadata
      .get(&(kind, id))
      .cloned()
      .ok_or(Error::NotFound { kind, id })
  }

  async fn store_model(
    &self,
    model: &ModelRecord,
    mut data: ByteStream,
    size: u64,
  ) -> Result<(), Error> {
    let fail = {
      let mut state = self.state();
      state.upload_attempts += 1;
      state.fail_uploads
    };
    if fail {
      return Err(Error::Io(std::io::Error::other("injected upload failure")));
    }

    let mut buffer = BytesMut::new();
    while let Some(chunk) = data.next().await {
      buffer.extend_from_slice(&chunk?);
    }

    let actual = buffer.len() as u64;
    if actual != size {
      return Err(Error::SizeMismatch {
        expected: size,
        actual,
      });
    }

    let mut state = self.state();
    state.metadata.insert(
      (ArtifactKind::Model, model.id),
      ArtifactMetadata::from(*model),
    );
    state
      .blobs
      .insert((ArtifactKind::Model, model.id), buffer.clone().freeze());
    state.models.push(StoredModel {
      record: *model,
      data: buffer.freeze(),
      declared_size: size,
    });
    Ok(())
  }
}
