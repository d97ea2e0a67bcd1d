//! Tagged single-worker task queues.
//!
//! Each runner owns one OS thread draining a FIFO channel. Tasks posted to the
//! same tag execute in post order and never run concurrently with each other;
//! runners never share threads.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{SchedError, SchedResult};

/// A unit of work for a runner or the timer.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque identifier of a runner.
pub type RunnerTag = u64;

enum RunnerMessage {
    Run(Task),
    Shutdown,
}

/// Completion handle returned by [`TaskRunners::post_task_and_get_result`].
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task has run and returns its result.
    pub fn wait(self) -> SchedResult<R> {
        self.rx.recv().map_err(|_| SchedError::TaskDropped)
    }

    /// Like [`TaskHandle::wait`] but gives up after `timeout`, returning `Ok(None)`.
    pub fn wait_timeout(&self, timeout: Duration) -> SchedResult<Option<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(Some(value)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SchedError::TaskDropped),
        }
    }
}

struct TaskRunner {
    tag: RunnerTag,
    sender: Mutex<Option<mpsc::Sender<RunnerMessage>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl TaskRunner {
    fn spawn(tag: RunnerTag) -> SchedResult<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("shiplog-runner-{}", tag))
            .spawn(move || run_loop(tag, rx))?;
        Ok(Self {
            tag,
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    fn post(&self, task: Task) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(RunnerMessage::Run(task)).is_ok(),
            None => false,
        }
    }

    fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Lets queued tasks finish, then joins the worker.
    fn shutdown(&self) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(RunnerMessage::Shutdown);
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if self.is_current_thread() {
                // Removed from inside one of its own tasks; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                error!(tag = self.tag, "runner thread panicked");
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(tag: RunnerTag, rx: mpsc::Receiver<RunnerMessage>) {
    debug!(tag, "task runner started");
    while let Ok(message) = rx.recv() {
        match message {
            RunnerMessage::Run(task) => {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(tag, "task panicked");
                }
            }
            RunnerMessage::Shutdown => break,
        }
    }
    debug!(tag, "task runner stopped");
}

/// Registry of runners keyed by tag.
pub struct TaskRunners {
    runners: Mutex<HashMap<RunnerTag, Arc<TaskRunner>>>,
    next_tag: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for TaskRunners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<RunnerTag> = self.runners.lock().keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("TaskRunners").field("tags", &tags).finish()
    }
}

impl Default for TaskRunners {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunners {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            runners: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Starts a runner under `tag`.
    ///
    /// If `tag` is already taken a fresh unused tag is allocated instead; the
    /// returned tag is the one to post to.
    pub fn add_task_runner(&self, tag: RunnerTag) -> SchedResult<RunnerTag> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        let mut runners = self.runners.lock();
        let mut chosen = tag;
        if runners.contains_key(&chosen) {
            loop {
                chosen = self.next_tag.fetch_add(1, Ordering::Relaxed);
                if !runners.contains_key(&chosen) {
                    break;
                }
            }
            warn!(requested = tag, assigned = chosen, "runner tag in use, assigned a new one");
        }
        let runner = TaskRunner::spawn(chosen)?;
        runners.insert(chosen, Arc::new(runner));
        Ok(chosen)
    }

    fn runner(&self, tag: RunnerTag) -> SchedResult<Arc<TaskRunner>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        self.runners
            .lock()
            .get(&tag)
            .cloned()
            .ok_or(SchedError::UnknownRunner(tag))
    }

    /// Enqueues `task` on the runner. Returns false, and drops the task, when
    /// the runner is unknown or stopped.
    pub fn post_task<F>(&self, tag: RunnerTag, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.runner(tag) {
            Ok(runner) => {
                let posted = runner.post(Box::new(task));
                if !posted {
                    warn!(tag, "runner stopped, task dropped");
                }
                posted
            }
            Err(e) => {
                warn!(tag, error = %e, "task dropped");
                false
            }
        }
    }

    /// Enqueues `task` and returns a handle that yields its result.
    pub fn post_task_and_get_result<F, R>(&self, tag: RunnerTag, task: F) -> SchedResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let runner = self.runner(tag)?;
        let (tx, rx) = mpsc::sync_channel(1);
        let posted = runner.post(Box::new(move || {
            let _ = tx.send(task());
        }));
        if !posted {
            return Err(SchedError::ShutDown);
        }
        Ok(TaskHandle { rx })
    }

    /// Blocks until every task posted to `tag` before this call has run.
    ///
    /// Called from the runner's own thread it returns immediately, since all
    /// earlier tasks have already completed.
    pub fn wait_idle(&self, tag: RunnerTag) -> SchedResult<()> {
        let runner = self.runner(tag)?;
        if runner.is_current_thread() {
            return Ok(());
        }
        drop(runner);
        self.post_task_and_get_result(tag, || ())?.wait()
    }

    /// Stops and joins one runner after its queued tasks finish.
    pub fn remove_task_runner(&self, tag: RunnerTag) -> bool {
        let removed = self.runners.lock().remove(&tag);
        match removed {
            Some(runner) => {
                runner.shutdown();
                debug!(tag, "task runner removed");
                true
            }
            None => false,
        }
    }

    /// Whether a runner is registered under `tag`.
    pub fn contains(&self, tag: RunnerTag) -> bool {
        self.runners.lock().contains_key(&tag)
    }

    /// Stops every runner. Later posts are dropped.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let drained: Vec<Arc<TaskRunner>> = self.runners.lock().drain().map(|(_, r)| r).collect();
        for runner in drained {
            runner.shutdown();
        }
    }
}

impl Drop for TaskRunners {
    fn drop(&mut self) {
        self.shutdown();
    }
}
