//! Kiln Orchestrator
//!
//! Drives one learn task at a time through a fixed pipeline and guarantees
//! that the task's workspace and loaded images are released on every exit
//! path.
//!
//! # Pipeline
//!
//! ```text
//! payload ──► decode/validate ──► claim (peer)
//!                                    │
//!        ┌───────────────────────────┘
//!        ▼
//!  prepare workspace ─► load images ─► stage data ─► [seed model]
//!        │                                              │
//!        │        ┌─────────────────────────────────────┘
//!        │        ▼
//!        │  detarget test ─► train ─► evaluate ─► package model ─► parse perf
//!        │                                                              │
//!        │                          report done / failed (peer) ◄───────┘
//!        ▼                                     │
//!  unload images + remove workspace ◄──────────┘
//! ```
//!
//! Any stage error stops the pipeline. The task is then reported as failed
//! once, and the workspace and images are released regardless.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_orchestrator::{LearnWorker, WorkerConfig};
//! use kiln_task::WorkerId;
//!
//! let worker = LearnWorker::new(WorkerConfig::new("/var/lib/kiln"), store, runtime, peer);
//! let identity = WorkerId::generate();
//!
//! let outcome = worker.handle_learn(&identity, &payload).await?;
//! println!("model {} scored {}", outcome.model, outcome.performance.perf);
//! ```

pub mod archive;
mod config;
mod error;
mod events;
mod images;
mod stage;
pub mod transfer;
mod worker;
mod workspace;

pub use config::WorkerConfig;
pub use error::{CleanupError, LearnError, TransportError};
pub use events::{ChannelNotifier, LearnEvent, LearnNotifier, NoopNotifier};
pub use images::ImageSet;
pub use stage::Stage;
pub use worker::{LearnOutcome, LearnWorker};
pub use workspace::Workspace;
