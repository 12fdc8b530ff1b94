use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use kiln_artifact::ByteStream;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::{ContainerError, ContainerRuntime, Mount, RunMode};

/// Configuration for the docker backend.
#[derive(Debug, Clone)]
pub struct DockerConfig {
  /// The docker CLI binary.
  pub binary: PathBuf,
  /// Network attached to learning containers. `none` keeps untrusted code offline.
  pub network: String,
  /// Extra arguments inserted before the image name on `docker run`.
  pub extra_run_args: Vec<String>,
}

impl Default for DockerConfig {
  fn default() -> Self {
    Self {
      binary: PathBuf::from("docker"),
      network: "none".to_string(),
      extra_run_args: Vec::new(),
    }
  }
}

/// Container runtime backed by the docker CLI.
///
/// `load` tags whatever reference the archive carried with the requested
/// name. That reference is remembered so `unload` removes it as well as the
/// name.
pub struct DockerRuntime {
  config: DockerConfig,
  references: Mutex<HashMap<String, String>>,
}

impl DockerRuntime {
  pub fn new(config: DockerConfig) -> Self {
    Self {
      config,
      references: Mutex::new(HashMap::new()),
    }
  }

  fn references(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    self.references.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn command(&self) -> Command {
    let mut command = Command::new(&self.config.binary);
    command.kill_on_drop(true);
    command
  }

  async fn exec(&self, args: &[String]) -> Result<Output, ContainerError> {
    let output = self.command().args(args).output().await?;
    check_status(args, output)
  }

  /// Arguments for `docker run`.
  fn run_args(&self, image: &str, mode: RunMode, mounts: &[Mount]) -> Vec<String> {
    let mut args = vec![
      "run".to_string(),
      "--rm".to_string(),
      "--network".to_string(),
      self.config.network.clone(),
    ];
    for mount in mounts {
      args.push("-v".to_string());
      args.push(format!("{}:{}", mount.source.display(), mount.target));
    }
    args.extend(self.config.extra_run_args.iter().cloned());
    args.push(image.to_string());
    args.push("-T".to_string());
    args.push(mode.as_str().to_string());
    args
  }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
  #[instrument(name = "docker_load", skip(self, image))]
  async fn load(&self, name: &str, mut image: ByteStream) -> Result<(), ContainerError> {
    let mut child = self
      .command()
      .arg("load")
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()?;

    let mut stdin = child
      .stdin
      .take()
      .ok_or_else(|| ContainerError::UnexpectedOutput("docker load has no stdin".to_string()))?;

    let mut fed = 0u64;
    while let Some(chunk) = image.next().await {
      let chunk = chunk?;
      if let Err(e) = stdin.write_all(&chunk).await {
        // docker exited early; its stderr says why.
        drop(stdin);
        let output = child.wait_with_output().await?;
        check_status(&["load".to_string()], output)?;
        return Err(e.into());
      }
      fed += chunk.len() as u64;
    }
    stdin.shutdown().await?;
    drop(stdin);

    let output = check_status(&["load".to_string()], child.wait_with_output().await?)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let loaded = parse_loaded_reference(&stdout)
      .ok_or_else(|| ContainerError::UnexpectedOutput(stdout.trim().to_string()))?;

    debug!(reference = %loaded, bytes = fed, "image loaded");
    self
      .exec(&["tag".to_string(), loaded.clone(), name.to_string()])
      .await?;
    info!("image tagged");

    // An image ID disappears with its last tag; only named references linger.
    if loaded != name && !is_image_id(&loaded) {
      self.references().insert(name.to_string(), loaded);
    }
    Ok(())
  }

  #[instrument(name = "docker_unload", skip(self))]
  async fn unload(&self, name: &str) -> Result<(), ContainerError> {
    self
      .exec(&["rmi".to_string(), "--force".to_string(), name.to_string()])
      .await?;

    let reference = self.references().remove(name);
    if let Some(reference) = reference {
      debug!(reference = %reference, "removing loaded reference");
      self
        .exec(&["rmi".to_string(), "--force".to_string(), reference])
        .await?;
    }
    Ok(())
  }

  #[instrument(name = "docker_run", skip(self, mounts), fields(mode = %mode))]
  async fn run(&self, image: &str, mode: RunMode, mounts: &[Mount]) -> Result<(), ContainerError> {
    let args = self.run_args(image, mode, mounts);
    debug!(args = ?args, "starting container");

    let output = self.command().args(&args).output().await?;
    if !output.status.success() {
      return Err(ContainerError::Run {
        image: image.to_string(),
        mode,
        message: format!(
          "exited with {}: {}",
          output.status,
          String::from_utf8_lossy(&output.stderr).trim()
        ),
      });
    }

    debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim(), "container exited");
    Ok(())
  }
}

fn check_status(args: &[String], output: Output) -> Result<Output, ContainerError> {
  if output.status.success() {
    return Ok(output);
  }
  Err(ContainerError::CommandFailed {
    command: format!("docker {}", args.join(" ")),
    status: output.status.to_string(),
    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
  })
}

fn is_image_id(reference: &str) -> bool {
  reference.starts_with("sha256:")
}

/// Extract the image reference from `docker load` output.
///
/// Tagged archives print `Loaded image: repo:tag`, untagged ones
/// `Loaded image ID: sha256:...`. Multi-image archives print several lines;
/// the last one wins.
fn parse_loaded_reference(stdout: &str) -> Option<String> {
  stdout
    .lines()
    .filter_map(|line| {
      let line = line.trim();
      line
        .strip_prefix("Loaded image ID:")
        .or_else(|| line.strip_prefix("Loaded image:"))
        .map(|reference| reference.trim().to_string())
    })
    .filter(|reference| !reference.is_empty())
    .last()
}
