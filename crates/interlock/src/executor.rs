// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fixed-size thread pool fed by a blocking deque.
//!
//! Workers are interruptible threads that pop tasks from the front of a
//! shared [`BlockingDeque`]. Shutdown plants a stop task: at the back for
//! [`Executor::shutdown`] (queued work drains first), at the front for
//! [`Executor::forced_shutdown`] (queued work is abandoned). A worker that
//! runs the stop task plants a fresh one at the front before exiting, so
//! the signal ripples through the whole pool.
//!
//! An executor must be shut down before it is dropped. Dropping a running
//! executor aborts the process.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::deque::BlockingDeque;
use crate::error::{panic_message, Error};
use crate::thread::{Builder, ThreadHandle};

const RUNNING: isize = 0;
const SHUTTING_DOWN: isize = -1;
const STOPPED: isize = -2;

/// What a worker does after running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

type Job = Box<dyn FnOnce() -> Step + Send>;

/// Queue entry. The job is taken out before it runs so the lock is not
/// held across user code.
struct Task {
    job: Mutex<Option<Job>>,
}

impl Task {
    fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Step + Send + 'static,
    {
        Self {
            job: Mutex::new(Some(Box::new(f))),
        }
    }

    fn stop() -> Self {
        Self::new(|| Step::Stop)
    }

    fn run(&self) -> Step {
        let job = self.job.lock().take();
        match job {
            Some(job) => job(),
            None => Step::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    Front,
    Back,
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Task queue capacity.
    pub capacity: usize,
    /// Workers are named `<name_prefix>-<index>`.
    pub name_prefix: String,
    /// Stack size for worker threads; platform default when `None`.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            capacity: BlockingDeque::<()>::MAX,
            name_prefix: "interlock-worker".to_string(),
            stack_size: None,
        }
    }
}

fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Result of a task handed to [`Executor::submit`].
#[derive(Debug)]
pub struct Pending<T> {
    rx: mpsc::Receiver<Result<T, String>>,
}

impl<T> Pending<T> {
    /// Block until the task has run.
    ///
    /// Fails with [`Error::Panicked`] if the task panicked and with
    /// [`Error::Abandoned`] if it was discarded by a forced shutdown.
    pub fn wait(self) -> Result<T, Error> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::Panicked(message)),
            Err(_) => Err(Error::Abandoned),
        }
    }
}

/// Pool of interruptible worker threads.
pub struct Executor {
    /// `0` running, `-1` shutting down, `-2` stopped.
    activeness: AtomicIsize,
    workers: Mutex<Vec<ThreadHandle<()>>>,
    tasks: Arc<BlockingDeque<Task>>,
    threads: usize,
}

impl Executor {
    /// Executor with `threads` workers and default settings otherwise.
    pub fn new(threads: usize) -> Result<Self, Error> {
        Self::with_config(ExecutorConfig {
            threads,
            ..ExecutorConfig::default()
        })
    }

    pub fn with_config(config: ExecutorConfig) -> Result<Self, Error> {
        if config.threads == 0 {
            return Err(Error::config("nthreads == 0"));
        }
        let tasks = Arc::new(BlockingDeque::new(config.capacity)?);

        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let mut builder = Builder::new().name(format!("{}-{}", config.name_prefix, index));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }
            let queue = Arc::clone(&tasks);
            match builder.spawn(move || work(index, &queue)) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    warn!(worker = index, error = %err, "failed to spawn worker, unwinding pool");
                    // Started workers are parked in pop_front; interruption ends them.
                    for handle in &workers {
                        let _ = handle.interrupt();
                    }
                    for mut handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        debug!(threads = config.threads, capacity = config.capacity, "executor started");
        Ok(Self {
            activeness: AtomicIsize::new(RUNNING),
            workers: Mutex::new(workers),
            tasks,
            threads: config.threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Tasks waiting to be picked up by a worker.
    pub fn queued(&self) -> usize {
        self.tasks.size()
    }

    pub fn is_running(&self) -> bool {
        self.activeness.load(Ordering::Acquire) == RUNNING
    }

    /// Queue `f` at the back. A panic in `f` is logged and swallowed.
    pub fn execute<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Placement::Back, detached(f))
    }

    /// Queue `f` at the front, ahead of everything already waiting.
    pub fn execute_front<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Placement::Front, detached(f))
    }

    /// Queue `f` at the back and return a handle to its result.
    pub fn submit<F, T>(&self, f: F) -> Result<Pending<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, pending) = observed(f);
        self.enqueue(Placement::Back, task)?;
        Ok(pending)
    }

    pub fn submit_front<F, T>(&self, f: F) -> Result<Pending<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, pending) = observed(f);
        self.enqueue(Placement::Front, task)?;
        Ok(pending)
    }

    /// Stop after every task queued so far has run.
    ///
    /// Safe to call from several threads; all of them return once the pool
    /// has stopped.
    pub fn shutdown(&self) {
        self.stop(Placement::Back);
    }

    /// Stop as soon as the running tasks finish. Queued tasks never run and
    /// their [`Pending`] handles report [`Error::Abandoned`].
    pub fn forced_shutdown(&self) {
        self.stop(Placement::Front);
    }

    fn enqueue(&self, placement: Placement, task: Task) -> Result<(), Error> {
        if self.activeness.load(Ordering::Acquire) != RUNNING {
            return Err(Error::ShutDown);
        }
        match placement {
            Placement::Front => self.tasks.emplace_front(task)?,
            Placement::Back => self.tasks.emplace_back(task)?,
        };
        Ok(())
    }

    /// Returns whether this call performed the shutdown pass.
    fn stop(&self, placement: Placement) -> bool {
        loop {
            match self.activeness.compare_exchange_weak(
                RUNNING,
                SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(STOPPED) => return false,
                // Lost the race, or a spurious failure; wait for the winner.
                Err(_) => thread::yield_now(),
            }
        }
        debug!(?placement, "executor shutting down");

        loop {
            let planted = match placement {
                Placement::Front => self.tasks.emplace_front(Task::stop()),
                Placement::Back => self.tasks.emplace_back(Task::stop()),
            };
            if planted.is_ok() {
                break;
            }
            thread::yield_now();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for mut handle in workers {
            if let Err(err) = handle.join() {
                warn!(error = %err, "worker ended abnormally");
            }
        }

        // Dropping leftover tasks closes their result channels.
        let mut discarded = 0usize;
        while self.tasks.try_pop_front().is_some() {
            discarded += 1;
        }
        self.activeness.store(STOPPED, Ordering::Release);
        debug!(discarded, "executor stopped");
        true
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.activeness.load(Ordering::Acquire) < RUNNING {
            return;
        }
        // Workers would be abandoned mid-task; unwinding is no exception.
        error!("executor dropped without shutdown, aborting");
        std::process::abort();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("activeness", &self.activeness.load(Ordering::Relaxed))
            .field("threads", &self.threads)
            .field("queued", &self.queued())
            .finish()
    }
}

fn detached<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Task::new(move || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            warn!(panic = %panic_message(&*payload), "task panicked");
        }
        Step::Continue
    })
}

fn observed<F, T>(f: F) -> (Task, Pending<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let task = Task::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| panic_message(&*payload));
        let _ = tx.send(outcome);
        Step::Continue
    });
    (task, Pending { rx })
}

fn work(index: usize, tasks: &BlockingDeque<Task>) {
    debug!(worker = index, "worker started");
    loop {
        let task = match tasks.pop_front() {
            Ok(task) => task,
            Err(_) => {
                debug!(worker = index, "worker interrupted");
                return;
            }
        };
        if task.run() == Step::Stop {
            // Pass the signal on to the next idle worker.
            while tasks.emplace_front(Task::stop()).is_err() {
                thread::yield_now();
            }
            debug!(worker = index, "worker exiting");
            return;
        }
    }
}
