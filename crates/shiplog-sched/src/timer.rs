//! Deadline timer for delayed and repeated tasks.
//!
//! One background thread services a min-heap ordered by absolute deadline, ties
//! broken by insertion order. Repeated tasks are re-enqueued at `now + delay`
//! after each synchronous run, so their cadence drifts by the execution time.
//!
//! Cancellation is cooperative: cancelling a repeated task flips its token, and
//! the timer checks the token before each run and again before re-scheduling.
//! An occurrence that already passed the first check still runs, so a cancel
//! racing with a tick may let one more invocation through.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::error::{SchedError, SchedResult};
use crate::runner::Task;

/// Identifier of a repeated task, used to cancel it.
pub type RepeatedTaskId = u64;

/// How many times a repeated task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// A fixed number of runs.
    Times(u32),
    /// Until cancelled or the timer stops.
    Forever,
}

impl Repeat {
    fn after_run(self) -> Option<Repeat> {
        match self {
            Repeat::Times(n) if n > 1 => Some(Repeat::Times(n - 1)),
            Repeat::Times(_) => None,
            Repeat::Forever => Some(Repeat::Forever),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type RepeatedFn = Box<dyn FnMut() + Send + 'static>;

enum Job {
    Once(Task),
    Repeated {
        id: RepeatedTaskId,
        task: RepeatedFn,
        delay: Duration,
        remaining: Repeat,
        token: CancelToken,
    },
}

struct Entry {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Entry>,
    live: HashMap<RepeatedTaskId, CancelToken>,
    next_seq: u64,
    next_id: RepeatedTaskId,
    stopped: bool,
}

impl TimerState {
    fn push(&mut self, deadline: Instant, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Entry { deadline, seq, job });
    }
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Single-threaded deadline scheduler.
pub struct DelayTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl std::fmt::Debug for DelayTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DelayTimer")
            .field("pending", &state.queue.len())
            .field("live_repeated", &state.live.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl DelayTimer {
    /// Starts the timer thread.
    pub fn start() -> SchedResult<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                next_id: 1,
                ..TimerState::default()
            }),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("shiplog-timer".to_string())
            .spawn(move || run_loop(worker))?;
        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Runs `task` once, `delay` from now. Returns false if the timer is stopped.
    pub fn post_delayed_task<F>(&self, task: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        state.push(Instant::now() + delay, Job::Once(Box::new(task)));
        self.shared.wake.notify_one();
        true
    }

    /// Runs `task` every `delay`, first at `now + delay`, as many times as
    /// `repeat` allows.
    pub fn post_repeated_task<F>(&self, task: F, delay: Duration, repeat: Repeat) -> SchedResult<RepeatedTaskId>
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(SchedError::ShutDown);
        }
        let id = state.next_id;
        state.next_id += 1;
        if repeat == Repeat::Times(0) {
            return Ok(id);
        }
        let token = CancelToken::default();
        state.live.insert(id, token.clone());
        state.push(
            Instant::now() + delay,
            Job::Repeated {
                id,
                task: Box::new(task),
                delay,
                remaining: repeat,
                token,
            },
        );
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancels a repeated task. Returns false if the id was not live.
    pub fn cancel_repeated_task(&self, id: RepeatedTaskId) -> bool {
        let mut state = self.shared.state.lock();
        match state.live.remove(&id) {
            Some(token) => {
                token.cancel();
                self.shared.wake.notify_one();
                true
            }
            None => false,
        }
    }

    /// Whether the repeated task still has runs ahead of it.
    pub fn is_live(&self, id: RepeatedTaskId) -> bool {
        self.shared.state.lock().live.contains_key(&id)
    }

    /// Stops the timer thread. Pending tasks are dropped without running.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            for token in state.live.values() {
                token.cancel();
            }
            state.live.clear();
            self.shared.wake.notify_all();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
    }
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<TimerShared>) {
    debug!("timer started");
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = Instant::now();
        match state.queue.peek().map(|e| e.deadline) {
            None => {
                shared.wake.wait(&mut state);
                continue;
            }
            Some(deadline) if deadline > now => {
                shared.wake.wait_until(&mut state, deadline);
                continue;
            }
            Some(_) => {}
        }
        let Some(entry) = state.queue.pop() else {
            continue;
        };
        match entry.job {
            Job::Once(task) => {
                MutexGuard::unlocked(&mut state, || {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("delayed task panicked");
                    }
                });
            }
            Job::Repeated {
                id,
                mut task,
                delay,
                remaining,
                token,
            } => {
                if token.is_cancelled() {
                    continue;
                }
                MutexGuard::unlocked(&mut state, || {
                    if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                        error!(id, "repeated task panicked");
                    }
                });
                match remaining.after_run() {
                    Some(rest) if !token.is_cancelled() && !state.stopped => {
                        state.push(
                            Instant::now() + delay,
                            Job::Repeated {
                                id,
                                task,
                                delay,
                                remaining: rest,
                                token,
                            },
                        );
                    }
                    _ => {
                        state.live.remove(&id);
                    }
                }
            }
        }
    }
    let dropped = state.queue.len();
    state.queue.clear();
    drop(state);
    debug!(dropped, "timer stopped");
}
