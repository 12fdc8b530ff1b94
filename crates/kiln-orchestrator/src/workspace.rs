//! Per-task workspace.
//!
//! ```text
//! {data_dir}/{algo}/
//! ├── train/
//! ├── test/
//! ├── untargeted_test/
//! ├── model/
//! ├── perf/
//! │   └── performance.json     written by the evaluate run
//! ├── model_start.tar.gz       transient, seed model download
//! └── model.tar.gz             transient, packaged model
//! ```
//!
//! The tree is namespaced by algorithm, not by task. Two tasks for the same
//! algorithm running at once on one worker share (and tear down) the same
//! directory. Nothing guards against it; a per-task suffix or a lock would
//! go here.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CleanupError;

pub const TRAIN_DIR: &str = "train";
pub const TEST_DIR: &str = "test";
pub const UNTARGETED_TEST_DIR: &str = "untargeted_test";
pub const MODEL_DIR: &str = "model";
pub const PERF_DIR: &str = "perf";
pub const PERFORMANCE_FILE: &str = "performance.json";
pub const MODEL_ARCHIVE: &str = "model.tar.gz";
pub const SEED_ARCHIVE: &str = "model_start.tar.gz";

/// Handle on a task workspace.
///
/// [`Workspace::remove`] deletes the tree. A handle dropped without being
/// removed (early return, panic, cancelled future) deletes it synchronously.
#[derive(Debug)]
pub struct Workspace {
  root: PathBuf,
  released: bool,
}

impl Workspace {
  /// Create an empty workspace tree for `algo` under `base`.
  ///
  /// A tree left behind by an earlier run that never cleaned up is removed
  /// first. A partially created tree is removed before the error is returned.
  pub async fn create(base: &Path, algo: Uuid) -> io::Result<Self> {
    let workspace = Self {
      root: base.join(algo.to_string()),
      released: false,
    };

    match fs::remove_dir_all(&workspace.root).await {
      Ok(()) => warn!(root = %workspace.root.display(), "removed stale workspace"),
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }

    for dir in [TRAIN_DIR, TEST_DIR, UNTARGETED_TEST_DIR, MODEL_DIR, PERF_DIR] {
      fs::create_dir_all(workspace.root.join(dir)).await?;
    }

    debug!(root = %workspace.root.display(), "workspace created");
    Ok(workspace)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn train(&self) -> PathBuf {
    self.root.join(TRAIN_DIR)
  }

  pub fn test(&self) -> PathBuf {
    self.root.join(TEST_DIR)
  }

  pub fn untargeted_test(&self) -> PathBuf {
    self.root.join(UNTARGETED_TEST_DIR)
  }

  pub fn model(&self) -> PathBuf {
    self.root.join(MODEL_DIR)
  }

  pub fn perf(&self) -> PathBuf {
    self.root.join(PERF_DIR)
  }

  pub fn performance_file(&self) -> PathBuf {
    self.perf().join(PERFORMANCE_FILE)
  }

  pub fn model_archive(&self) -> PathBuf {
    self.root.join(MODEL_ARCHIVE)
  }

  pub fn seed_archive(&self) -> PathBuf {
    self.root.join(SEED_ARCHIVE)
  }

  /// Delete the whole tree.
  pub async fn remove(mut self) -> Result<(), CleanupError> {
    self.released = true;
    match fs::remove_dir_all(&self.root).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(CleanupError::Workspace {
        path: self.root.clone(),
        source,
      }),
    }
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    if let Err(e) = std::fs::remove_dir_all(&self.root)
      && e.kind() != io::ErrorKind::NotFound
    {
      warn!(root = %self.root.display(), error = %e, "failed to remove dropped workspace");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_create_builds_tree() {
    let base = tempfile::tempdir().unwrap();
    let algo = Uuid::new_v4();

    let workspace = Workspace::create(base.path(), algo).await.unwrap();
    assert_eq!(workspace.root(), base.path().join(algo.to_string()));
    for dir in [
      workspace.train(),
      workspace.test(),
      workspace.untargeted_test(),
      workspace.model(),
      workspace.perf(),
    ] {
      assert!(dir.is_dir(), "{} should exist", dir.display());
    }

    let root = workspace.root().to_path_buf();
    workspace.remove().await.unwrap();
    assert!(!root.exists());
  }

  #[tokio::test]
  async fn test_drop_removes_tree() {
    let base = tempfile::tempdir().unwrap();
    let workspace = Workspace::create(base.path(), Uuid::new_v4()).await.unwrap();
    let root = workspace.root().to_path_buf();
    std::fs::write(workspace.train().join("data"), b"rows").unwrap();

    drop(workspace);
    assert!(!root.exists());
  }

  #[tokio::test]
  async fn test_failed_create_leaves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    // A file where the base directory must go.
    let base = dir.path().join("data");
    std::fs::write(&base, b"not a directory").unwrap();

    assert!(Workspace::create(&base, Uuid::new_v4()).await.is_err());
    assert_eq!(std::fs::read(&base).unwrap(), b"not a directory");
  }

  #[tokio::test]
  async fn test_create_discards_stale_tree() {
    let base = tempfile::tempdir().unwrap();
    let algo = Uuid::new_v4();
    let root = base.path().join(algo.to_string());
    std::fs::create_dir_all(root.join(MODEL_DIR)).unwrap();
    std::fs::create_dir_all(root.join(PERF_DIR)).unwrap();
    std::fs::write(root.join(MODEL_DIR).join("leftover.bin"), b"old weights").unwrap();
    std::fs::write(root.join(PERF_DIR).join(PERFORMANCE_FILE), b"{\"perf\":1.0}").unwrap();
    // A file where a directory must go is replaced too.
    std::fs::write(root.join(TRAIN_DIR), b"not a directory").unwrap();

    let workspace = Workspace::create(base.path(), algo).await.unwrap();
    assert!(workspace.train().is_dir());
    assert_eq!(std::fs::read_dir(workspace.model()).unwrap().count(), 0);
    assert!(!workspace.performance_file().exists());
    workspace.remove().await.unwrap();
  }

  #[tokio::test]
  async fn test_remove_missing_tree_is_ok() {
    let base = tempfile::tempdir().unwrap();
    let workspace = Workspace::create(base.path(), Uuid::new_v4()).await.unwrap();
    std::fs::remove_dir_all(workspace.root()).unwrap();
    assert!(workspace.remove().await.is_ok());
  }
}
