//! Learn events and notifiers for observability.
//!
//! Events are emitted while a learn task runs so that consumers can follow
//! its progress, export it, or assert on it in tests.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::stage::Stage;

/// Events emitted while a learn task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LearnEvent {
  /// A payload decoded into a valid task.
  TaskReceived { task_key: String },

  /// A stage has started.
  StageStarted { task_key: String, stage: Stage },

  /// A stage has completed successfully.
  StageCompleted { task_key: String, stage: Stage },

  /// A stage has failed.
  StageFailed {
    task_key: String,
    stage: Stage,
    error: String,
  },

  /// The task was reported done.
  TaskSucceeded { task_key: String },

  /// The task ended in error.
  TaskFailed { task_key: String, error: String },
}

/// Trait for receiving learn events.
///
/// The worker calls `notify` for each event; implementations decide what
/// to do with them.
pub trait LearnNotifier: Send + Sync {
  /// Called when a learn event occurs.
  fn notify(&self, event: LearnEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl LearnNotifier for NoopNotifier {
  fn notify(&self, _event: LearnEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a running task. One event per
  // stage transition keeps the volume small.
  sender: mpsc::UnboundedSender<LearnEvent>,
}

impl ChannelNotifier {
  /// Create a new channel notifier.
  pub fn new(sender: mpsc::UnboundedSender<LearnEvent>) -> Self {
    Self { sender }
  }
}

impl LearnNotifier for ChannelNotifier {
  fn notify(&self, event: LearnEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
