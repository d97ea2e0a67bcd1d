#![warn(missing_docs)]

//! Shiplog scheduling: tagged single-worker FIFO runners and a deadline timer.
//!
//! Runners serialize background work per tag (one OS thread each). The timer
//! thread fires delayed and repeated tasks. [`Scheduler`] bundles both and is
//! passed to components explicitly.

pub mod error;
pub mod runner;
pub mod scheduler;
pub mod timer;

pub use error::{SchedError, SchedResult};
pub use runner::{RunnerTag, Task, TaskHandle, TaskRunners};
pub use scheduler::Scheduler;
pub use timer::{DelayTimer, Repeat, RepeatedTaskId};
