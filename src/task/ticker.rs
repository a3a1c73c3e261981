use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashSet;
use tracing::{debug, error, trace};
use crate::task::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Returned by a scheduled callback. A repeating task stops repeating when it returns `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Done,
}

type Callback = Box<dyn FnMut() -> TaskOutcome + Send + 'static>;

struct ScheduledTask {
    id: u64,
    callback: Callback,
    wait: Duration,
    elapsed: Duration,
    repeat: bool,
}

struct TickerShared {
    interval: Duration,
    /// tasks scheduled since the last sweep
    incoming: Mutex<Vec<ScheduledTask>>,
    /// ids cancelled since the last sweep
    cancelled: Mutex<FxHashSet<u64>>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
    next_id: AtomicU64,
}

impl TickerShared {
    fn run(&self) {
        debug!("ticker started with an interval of {:?}", self.interval);
        let mut tasks: Vec<ScheduledTask> = Vec::new();

        loop {
            {
                let stopped = self.stopped.lock().unwrap();
                let (stopped, _) = self.stop_signal
                    .wait_timeout_while(stopped, self.interval, |stopped| !*stopped)
                    .unwrap();
                if *stopped {
                    break;
                }
            }

            // cancelled ids first: a task is always scheduled before it is cancelled, so every
            //  id in the set refers to a task that is either in `incoming` or already in `tasks`
            let cancelled = std::mem::take(&mut *self.cancelled.lock().unwrap());
            tasks.append(&mut self.incoming.lock().unwrap());

            if !cancelled.is_empty() {
                tasks.retain(|t| {
                    let keep = !cancelled.contains(&t.id);
                    if !keep {
                        trace!("dropping cancelled task {}", t.id);
                    }
                    keep
                });
            }

            tasks = tasks.into_iter()
                .filter_map(|t| self.advance(t))
                .collect();
        }

        debug!("ticker stopped, discarding {} scheduled tasks", tasks.len());
    }

    /// advances a task's clock by one interval, firing it when due. Returns the task if it stays
    ///  scheduled.
    fn advance(&self, mut task: ScheduledTask) -> Option<ScheduledTask> {
        task.elapsed += self.interval;
        if task.elapsed < task.wait {
            return Some(task);
        }

        trace!("firing scheduled task {}", task.id);
        let outcome = match catch_unwind(AssertUnwindSafe(|| (task.callback)())) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("scheduled task {} panicked", task.id);
                TaskOutcome::Continue
            }
        };

        if task.repeat && outcome == TaskOutcome::Continue {
            task.elapsed = Duration::ZERO;
            Some(task)
        }
        else {
            None
        }
    }
}

/// Fires scheduled callbacks on a single dedicated thread, sweeping all scheduled tasks once per
///  tick interval. Callbacks run inline on the ticker thread, so they should be short - typically
///  they submit the real work to a [WorkerPool].
///
/// Timing is approximate: a task fires on the first sweep at which its accumulated elapsed time
///  reaches its wait time. A task scheduled with zero wait is handed to the worker pool right
///  away instead.
pub struct ScheduledTicker {
    shared: Arc<TickerShared>,
    worker_pool: Arc<WorkerPool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTicker {
    pub fn new(interval: Duration, worker_pool: Arc<WorkerPool>) -> anyhow::Result<ScheduledTicker> {
        if interval.is_zero() {
            bail!("ticker interval must be positive");
        }

        let shared = Arc::new(TickerShared {
            interval,
            incoming: Default::default(),
            cancelled: Default::default(),
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
            next_id: AtomicU64::new(0),
        });

        let ticker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("ticker".to_string())
            .spawn(move || ticker_shared.run())?;

        Ok(ScheduledTicker {
            shared,
            worker_pool,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn schedule(&self, wait: Duration, repeat: bool, callback: impl FnMut() -> TaskOutcome + Send + 'static) -> anyhow::Result<TaskHandle> {
        if *self.shared.stopped.lock().unwrap() {
            bail!("ticker is shut down");
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::AcqRel);

        if wait.is_zero() {
            if repeat {
                debug!("task {} has no delay - running it once on the worker pool, ignoring the repeat flag", id);
            }
            else {
                trace!("task {} has no delay - submitting it to the worker pool", id);
            }
            let mut callback = callback;
            self.worker_pool.submit(move || { callback(); })?;
        }
        else {
            self.shared.incoming.lock().unwrap().push(ScheduledTask {
                id,
                callback: Box::new(callback),
                wait,
                elapsed: Duration::ZERO,
                repeat,
            });
        }
        Ok(TaskHandle(id))
    }

    pub fn schedule_once(&self, wait: Duration, callback: impl FnOnce() + Send + 'static) -> anyhow::Result<TaskHandle> {
        let mut callback = Some(callback);
        self.schedule(wait, false, move || {
            if let Some(callback) = callback.take() {
                callback();
            }
            TaskOutcome::Done
        })
    }

    /// Cancellation is cooperative: it takes effect at the next sweep, and a callback that is
    ///  currently firing runs to completion.
    pub fn cancel(&self, handle: TaskHandle) {
        self.shared.cancelled.lock().unwrap().insert(handle.0);
    }

    pub fn shutdown(&self) {
        {
            let mut stopped = self.shared.stopped.lock().unwrap();
            if *stopped {
                return;
            }
            *stopped = true;
            self.shared.stop_signal.notify_all();
        }
        self.shared.incoming.lock().unwrap().clear();

        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("ticker thread terminated with a panic");
            }
        }
    }
}

impl Drop for ScheduledTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
