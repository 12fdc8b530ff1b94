use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use kiln_artifact::ByteStream;
use tracing::debug;

use crate::{
  ContainerError, ContainerRuntime, MODEL_TARGET, Mount, PERF_TARGET, RunMode, TEST_TARGET,
  UNTARGETED_TEST_TARGET, mounted_at,
};

/// Performance descriptor written by the default evaluate handler.
pub const MOCK_PERFORMANCE: &str = r#"{"perf":0.5,"train_perf":{"p":0.5},"test_perf":{"p":0.5}}"#;

/// File written into the model mount by the default train handler.
pub const MOCK_MODEL_FILE: &str = "model.bin";

/// Side effect of a mocked container run.
pub type MockHandler =
  Arc<dyn Fn(&str, RunMode, &[Mount]) -> Result<(), ContainerError> + Send + Sync>;

/// A call received by the mock runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
  Load { name: String, bytes: u64 },
  Unload { name: String },
  Run { image: String, mode: RunMode, mounts: Vec<Mount> },
}

struct State {
  loaded: HashSet<String>,
  calls: Vec<RuntimeCall>,
  failing_loads: HashSet<String>,
  failing_unloads: HashSet<String>,
  failing_modes: HashSet<RunMode>,
}

/// Deterministic in-memory container runtime.
///
/// Tracks loaded images, records every call and runs a handler in place of a
/// container. Runs of an image that is not loaded fail. Cloning shares state.
#[derive(Clone)]
pub struct MockRuntime {
  state: Arc<Mutex<State>>,
  handler: MockHandler,
}

impl Default for MockRuntime {
  fn default() -> Self {
    Self::new()
  }
}

impl MockRuntime {
  /// A mock runtime using [`default_handler`].
  pub fn new() -> Self {
    Self::with_handler(Arc::new(default_handler))
  }

  /// A mock runtime with a custom run handler.
  pub fn with_handler(handler: MockHandler) -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        loaded: HashSet::new(),
        calls: Vec::new(),
        failing_loads: HashSet::new(),
        failing_unloads: HashSet::new(),
        failing_modes: HashSet::new(),
      })),
      handler,
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Make loading `name` fail.
  pub fn fail_load(&self, name: impl Into<String>) {
    self.state().failing_loads.insert(name.into());
  }

  /// Make unloading `name` fail.
  pub fn fail_unload(&self, name: impl Into<String>) {
    self.state().failing_unloads.insert(name.into());
  }

  /// Make every run in `mode` fail.
  pub fn fail_run(&self, mode: RunMode) {
    self.state().failing_modes.insert(mode);
  }

  /// All calls, in order.
  pub fn calls(&self) -> Vec<RuntimeCall> {
    self.state().calls.clone()
  }

  /// Run calls only, as `(image, mode)` pairs.
  pub fn runs(&self) -> Vec<(String, RunMode)> {
    self
      .state()
      .calls
      .iter()
      .filter_map(|call| match call {
        RuntimeCall::Run { image, mode, .. } => Some((image.clone(), *mode)),
        _ => None,
      })
      .collect()
  }

  /// Images currently loaded.
  pub fn loaded(&self) -> HashSet<String> {
    self.state().loaded.clone()
  }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
  async fn load(&self, name: &str, mut image: ByteStream) -> Result<(), ContainerError> {
    let mut bytes = 0u64;
    while let Some(chunk) = image.next().await {
      bytes += chunk?.len() as u64;
    }

    let mut state = self.state();
    state.calls.push(RuntimeCall::Load {
      name: name.to_string(),
      bytes,
    });
    if state.failing_loads.contains(name) {
      return Err(ContainerError::CommandFailed {
        command: format!("load {}", name),
        status: "1".to_string(),
        stderr: "injected load failure".to_string(),
      });
    }
    state.loaded.insert(name.to_string());
    debug!(name, bytes, "mock image loaded");
    Ok(())
  }

  async fn unload(&self, name: &str) -> Result<(), ContainerError> {
    let mut state = self.state();
    state.calls.push(RuntimeCall::Unload {
      name: name.to_string(),
    });
    if state.failing_unloads.contains(name) {
      return Err(ContainerError::CommandFailed {
        command: format!("unload {}", name),
        status: "1".to_string(),
        stderr: "injected unload failure".to_string(),
      });
    }
    if !state.loaded.remove(name) {
      return Err(ContainerError::ImageNotLoaded(name.to_string()));
    }
    Ok(())
  }

  async fn run(&self, image: &str, mode: RunMode, mounts: &[Mount]) -> Result<(), ContainerError> {
    {
      let mut state = self.state();
      state.calls.push(RuntimeCall::Run {
        image: image.to_string(),
        mode,
        mounts: mounts.to_vec(),
      });
      if !state.loaded.contains(image) {
        return Err(ContainerError::ImageNotLoaded(image.to_string()));
      }
      if state.failing_modes.contains(&mode) {
        return Err(ContainerError::Run {
          image: image.to_string(),
          mode,
          message: "injected run failure".to_string(),
        });
      }
    }

    (self.handler)(image, mode, mounts)
  }
}

/// Stand-in for what real problem and algorithm images do.
///
/// - detarget copies every test file into the untargeted mount
/// - train writes [`MOCK_MODEL_FILE`] into the model mount
/// - evaluate writes [`MOCK_PERFORMANCE`] to `performance.json` in the perf mount
pub fn default_handler(image: &str, mode: RunMode, mounts: &[Mount]) -> Result<(), ContainerError> {
  let mount = |target: &str| {
    mounted_at(mounts, target).ok_or_else(|| ContainerError::Run {
      image: image.to_string(),
      mode,
      message: format!("{} is not mounted", target),
    })
  };

  match mode {
    RunMode::Detarget => {
      let test = mount(TEST_TARGET)?;
      let untargeted = mount(UNTARGETED_TEST_TARGET)?;
      copy_files(test, untargeted)?;
    }
    RunMode::Train => {
      let model = mount(MODEL_TARGET)?;
      fs::write(model.join(MOCK_MODEL_FILE), format!("trained by {}", image))?;
    }
    RunMode::Evaluate => {
      mount(MODEL_TARGET)?;
      let perf = mount(PERF_TARGET)?;
      fs::write(perf.join("performance.json"), MOCK_PERFORMANCE)?;
    }
  }
  Ok(())
}

fn copy_files(from: &Path, to: &Path) -> std::io::Result<()> {
  for entry in fs::read_dir(from)? {
    let entry = entry?;
    if entry.file_type()?.is_file() {
      fs::copy(entry.path(), to.join(entry.file_name()))?;
    }
  }
  Ok(())
}
