use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::thread::JoinHandle;
use anyhow::bail;
use tracing::{debug, error, info, trace};

/// A unit of work. Everything a task needs is captured (and owned) by the closure, so dropping
///  a task that never ran releases its parameters.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    pending: VecDeque<Task>,
    /// indexes of workers waiting for a task in their mailbox
    idle: VecDeque<usize>,
    shutting_down: bool,
}

#[derive(Default)]
struct MailboxContent {
    task: Option<Task>,
    stop: bool,
}

/// Direct hand-over of a task to an idle worker. Each worker blocks on its own condition variable.
#[derive(Default)]
struct Mailbox {
    content: Mutex<MailboxContent>,
    wakeup: Condvar,
}

impl Mailbox {
    fn deliver(&self, task: Task) {
        let mut content = self.content.lock().unwrap();
        debug_assert!(content.task.is_none());
        content.task = Some(task);
        self.wakeup.notify_one();
    }

    fn stop(&self) {
        self.content.lock().unwrap().stop = true;
        self.wakeup.notify_one();
    }

    /// blocks until a task is delivered, returning `None` when the pool stops
    fn wait_for_task(&self) -> Option<Task> {
        let mut content = self.content.lock().unwrap();
        loop {
            if let Some(task) = content.task.take() {
                return Some(task);
            }
            if content.stop {
                return None;
            }
            content = self.wakeup.wait(content).unwrap();
        }
    }
}

struct Shared {
    name: String,
    state: Mutex<PoolState>,
    mailboxes: Vec<Mailbox>,
    handles: Vec<Mutex<Option<JoinHandle<()>>>>,
    num_restarts: AtomicUsize,
}

impl Shared {
    fn spawn_worker(self: &Arc<Self>, idx: usize) -> anyhow::Result<()> {
        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, idx))
            .spawn(move || {
                let _sentinel = Sentinel { shared: shared.clone(), idx };
                shared.worker_loop(idx);
            })?;

        *self.handles[idx].lock().unwrap() = Some(handle);
        Ok(())
    }

    fn worker_loop(&self, idx: usize) {
        trace!("worker {} started", idx);
        loop {
            let queued = {
                // checking the queue and registering as idle is atomic w.r.t. submissions
                let mut state = self.state.lock().unwrap();
                if let Some(task) = state.pending.pop_front() {
                    Some(task)
                }
                else if state.shutting_down {
                    break;
                }
                else {
                    state.idle.push_back(idx);
                    None
                }
            };

            let task = match queued {
                Some(task) => task,
                None => match self.mailboxes[idx].wait_for_task() {
                    Some(task) => task,
                    None => break,
                },
            };

            task();
        }
        trace!("worker {} terminated", idx);
    }

    /// called while a worker thread unwinds from a panicking task
    fn replace_worker(self: &Arc<Self>, idx: usize) {
        let state = self.state.lock().unwrap();
        if state.shutting_down {
            debug!("worker {} of pool {} died during shutdown - not replacing it", idx, self.name);
            return;
        }

        self.num_restarts.fetch_add(1, Ordering::AcqRel);
        match self.spawn_worker(idx) {
            Ok(()) => info!("replaced worker {} of pool {}", idx, self.name),
            Err(e) => error!("failed to replace worker {} of pool {}: {}", idx, self.name, e),
        }
        drop(state);
    }
}

/// Lives on a worker thread's stack and replaces the worker if the thread dies from a panic
struct Sentinel {
    shared: Arc<Shared>,
    idx: usize,
}
impl Drop for Sentinel {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("worker {} of pool {} terminated by a panicking task", self.idx, self.shared.name);
            self.shared.replace_worker(self.idx);
        }
    }
}


/// A fixed set of worker threads executing submitted tasks. Submission hands the task directly
///  to an idle worker if there is one, and queues it otherwise.
///
/// Tasks run to completion and are not cancellable. A worker that dies from a panicking task is
///  replaced by a fresh worker in the same slot.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(name: &str, num_workers: usize) -> anyhow::Result<WorkerPool> {
        if num_workers == 0 {
            bail!("a worker pool needs at least one worker");
        }

        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(PoolState {
                pending: VecDeque::new(),
                idle: VecDeque::with_capacity(num_workers),
                shutting_down: false,
            }),
            mailboxes: (0..num_workers).map(|_| Mailbox::default()).collect(),
            handles: (0..num_workers).map(|_| Mutex::new(None)).collect(),
            num_restarts: AtomicUsize::new(0),
        });

        let pool = WorkerPool { shared };
        for idx in 0..num_workers {
            if let Err(e) = pool.shared.spawn_worker(idx) {
                pool.shutdown();
                return Err(e);
            }
        }
        debug!("started worker pool {} with {} workers", name, num_workers);
        Ok(pool)
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutting_down {
            bail!("worker pool {} is shut down", self.shared.name);
        }

        if let Some(idx) = state.idle.pop_front() {
            trace!("handing task to idle worker {}", idx);
            self.shared.mailboxes[idx].deliver(Box::new(task));
        }
        else {
            state.pending.push_back(Box::new(task));
            trace!("all workers busy - queued task, {} pending", state.pending.len());
        }
        Ok(())
    }

    pub fn num_workers(&self) -> usize {
        self.shared.mailboxes.len()
    }

    pub fn num_queued(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    /// number of workers that were replaced after dying from a panic
    pub fn num_restarts(&self) -> usize {
        self.shared.num_restarts.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().unwrap().shutting_down
    }

    /// Drops all queued tasks without running them, lets running tasks finish and joins the
    ///  workers. Idempotent.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.idle.clear();
            std::mem::take(&mut state.pending)
        };
        if !drained.is_empty() {
            info!("shutting down worker pool {}: discarding {} queued tasks", self.shared.name, drained.len());
        }
        drop(drained);

        for mailbox in &self.shared.mailboxes {
            mailbox.stop();
        }

        for slot in &self.shared.handles {
            let handle = slot.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.thread().id() == thread::current().id() {
                    // shut down from inside a task - the worker exits when the task returns
                    continue;
                }
                if handle.join().is_err() {
                    debug!("worker of pool {} had terminated with a panic", self.shared.name);
                }
            }
        }
        debug!("worker pool {} is shut down", self.shared.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
