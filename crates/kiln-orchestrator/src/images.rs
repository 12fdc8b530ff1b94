//! Images loaded for one task.

use std::sync::Arc;

use kiln_artifact::ByteStream;
use kiln_container::{ContainerError, ContainerRuntime};
use tracing::{debug, warn};

use crate::error::CleanupError;

/// The images a task has loaded into the container runtime.
///
/// Every successful load is recorded so that [`ImageSet::release`] unloads
/// exactly what was loaded, including after a partial failure. A set dropped
/// without being released schedules the unloads on the current tokio
/// runtime.
pub struct ImageSet {
  runtime: Arc<dyn ContainerRuntime>,
  loaded: Vec<String>,
}

impl ImageSet {
  pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
    Self {
      runtime,
      loaded: Vec::new(),
    }
  }

  /// Load `image` as `name`.
  pub async fn load(&mut self, name: &str, image: ByteStream) -> Result<(), ContainerError> {
    self.runtime.load(name, image).await?;
    debug!(image = name, "image loaded");
    self.loaded.push(name.to_string());
    Ok(())
  }

  /// Names of the images loaded so far.
  pub fn loaded(&self) -> &[String] {
    &self.loaded
  }

  /// Unload every image, most recent first. Returns the failures.
  pub async fn release(mut self) -> Vec<CleanupError> {
    let names = std::mem::take(&mut self.loaded);
    let mut errors = Vec::new();

    for image in names.into_iter().rev() {
      match self.runtime.unload(&image).await {
        Ok(()) => debug!(image = %image, "image unloaded"),
        Err(source) => errors.push(CleanupError::Unload { image, source }),
      }
    }

    errors
  }
}

impl Drop for ImageSet {
  fn drop(&mut self) {
    if self.loaded.is_empty() {
      return;
    }

    let names = std::mem::take(&mut self.loaded);
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!(images = ?names, "images dropped outside a runtime, leaving them loaded");
      return;
    };

    warn!(images = ?names, "images dropped without release, unloading in background");
    let runtime = self.runtime.clone();
    handle.spawn(async move {
      for image in names.into_iter().rev() {
        if let Err(e) = runtime.unload(&image).await {
          warn!(image = %image, error = %e, "background unload failed");
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use kiln_container::{MockRuntime, RuntimeCall};

  fn image() -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(b"img"))]))
  }

  #[tokio::test]
  async fn test_release_unloads_in_reverse_order() {
    let runtime = MockRuntime::new();
    let mut images = ImageSet::new(Arc::new(runtime.clone()));

    images.load("problem-1", image()).await.unwrap();
    images.load("algo-1", image()).await.unwrap();
    assert_eq!(images.loaded(), ["problem-1", "algo-1"]);

    let errors = images.release().await;
    assert!(errors.is_empty());
    assert!(runtime.loaded().is_empty());

    let unloads: Vec<_> = runtime
      .calls()
      .into_iter()
      .filter_map(|c| match c {
        RuntimeCall::Unload { name } => Some(name),
        _ => None,
      })
      .collect();
    assert_eq!(unloads, vec!["algo-1", "problem-1"]);
  }

  #[tokio::test]
  async fn test_failed_load_is_not_recorded() {
    let runtime = MockRuntime::new();
    runtime.fail_load("algo-1");
    let mut images = ImageSet::new(Arc::new(runtime.clone()));

    images.load("problem-1", image()).await.unwrap();
    assert!(images.load("algo-1", image()).await.is_err());
    assert_eq!(images.loaded(), ["problem-1"]);

    assert!(images.release().await.is_empty());
    assert!(runtime.loaded().is_empty());
  }

  #[tokio::test]
  async fn test_release_reports_unload_failures() {
    let runtime = MockRuntime::new();
    runtime.fail_unload("algo-1");
    let mut images = ImageSet::new(Arc::new(runtime.clone()));
    images.load("problem-1", image()).await.unwrap();
    images.load("algo-1", image()).await.unwrap();

    let errors = images.release().await;
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], CleanupError::Unload { image, .. } if image == "algo-1"));
    // The other image is still unloaded.
    assert_eq!(runtime.loaded().len(), 1);
  }
}
