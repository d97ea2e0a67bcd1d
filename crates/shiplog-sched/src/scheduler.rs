//! Explicitly constructed scheduler combining tagged runners and the timer.
//!
//! Components receive an `Arc<Scheduler>` instead of reaching for process-wide
//! state, so independent instances can coexist in one process.

use std::time::Duration;

use tracing::debug;

use crate::error::SchedResult;
use crate::runner::{RunnerTag, TaskHandle, TaskRunners};
use crate::timer::{DelayTimer, Repeat, RepeatedTaskId};

/// Tagged runners plus one deadline timer.
#[derive(Debug)]
pub struct Scheduler {
    runners: TaskRunners,
    timer: DelayTimer,
}

impl Scheduler {
    /// Starts the timer thread. Runners are added on demand.
    pub fn new() -> SchedResult<Self> {
        Ok(Self {
            runners: TaskRunners::new(),
            timer: DelayTimer::start()?,
        })
    }

    /// See [`TaskRunners::add_task_runner`].
    pub fn add_task_runner(&self, tag: RunnerTag) -> SchedResult<RunnerTag> {
        self.runners.add_task_runner(tag)
    }

    /// See [`TaskRunners::remove_task_runner`].
    pub fn remove_task_runner(&self, tag: RunnerTag) -> bool {
        self.runners.remove_task_runner(tag)
    }

    /// See [`TaskRunners::post_task`].
    pub fn post_task<F>(&self, tag: RunnerTag, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.runners.post_task(tag, task)
    }

    /// See [`TaskRunners::post_task_and_get_result`].
    pub fn post_task_and_get_result<F, R>(&self, tag: RunnerTag, task: F) -> SchedResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runners.post_task_and_get_result(tag, task)
    }

    /// See [`TaskRunners::wait_idle`].
    pub fn wait_idle(&self, tag: RunnerTag) -> SchedResult<()> {
        self.runners.wait_idle(tag)
    }

    /// See [`DelayTimer::post_delayed_task`].
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.timer.post_delayed_task(task, delay)
    }

    /// See [`DelayTimer::post_repeated_task`].
    pub fn post_repeated_task<F>(&self, task: F, delay: Duration, repeat: Repeat) -> SchedResult<RepeatedTaskId>
    where
        F: FnMut() + Send + 'static,
    {
        self.timer.post_repeated_task(task, delay, repeat)
    }

    /// See [`DelayTimer::cancel_repeated_task`].
    pub fn cancel_repeated_task(&self, id: RepeatedTaskId) -> bool {
        self.timer.cancel_repeated_task(id)
    }

    /// The runner registry.
    pub fn runners(&self) -> &TaskRunners {
        &self.runners
    }

    /// The deadline timer.
    pub fn timer(&self) -> &DelayTimer {
        &self.timer
    }

    /// Stops the timer, then drains and joins every runner.
    pub fn shutdown(&self) {
        self.timer.stop();
        self.runners.shutdown();
        debug!("scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
