//! Kiln Task
//!
//! Types shared by every part of the worker: the learn task as it arrives
//! on the queue, the status vocabulary used when reporting to the peer, the
//! performance record produced by evaluation, and the worker identity.
//!
//! Decoding and validation live here so that a malformed payload is rejected
//! before any collaborator is contacted.

mod error;
mod perf;
mod task;
mod worker;

pub use error::ValidationError;
pub use perf::PerformanceRecord;
pub use task::{LearnTask, TaskStatus};
pub use worker::WorkerId;
