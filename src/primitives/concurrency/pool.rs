use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::pin_current_thread;
use crate::types::{Result, StoreError};

/// Unit of polling logic a worker runs in its loop.
///
/// `run` claims at most one item and returns `Ok(true)` when it did useful
/// work. An `Err` is reported on the pool's error channel.
pub trait Job: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;
    /// Claims and executes at most one item.
    fn run(&self, worker_id: usize) -> Result<bool>;
}

/// Backoff applied by a worker that found nothing to do.
#[derive(Clone, Copy, Debug)]
pub struct IdleStrategy {
    /// Idle rounds spent spinning.
    pub spin_rounds: u32,
    /// Further idle rounds spent yielding the CPU.
    pub yield_rounds: u32,
    /// Park duration once spinning and yielding are exhausted.
    pub park: Duration,
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self {
            spin_rounds: 64,
            yield_rounds: 64,
            park: Duration::from_millis(1),
        }
    }
}

impl IdleStrategy {
    fn backoff(&self, idle_rounds: u32) {
        if idle_rounds < self.spin_rounds {
            std::hint::spin_loop();
        } else if idle_rounds < self.spin_rounds + self.yield_rounds {
            thread::yield_now();
        } else {
            thread::park_timeout(self.park);
        }
    }
}

/// Worker pool configuration.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Optional CPU per worker; missing entries mean "not pinned".
    pub affinity: Vec<Option<usize>>,
    /// Whether one failed job halts the whole pool.
    pub halt_on_error: bool,
    /// Thread name prefix.
    pub name: String,
    /// Idle backoff policy.
    pub idle: IdleStrategy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            affinity: Vec::new(),
            halt_on_error: false,
            name: "chronocol-worker".to_string(),
            idle: IdleStrategy::default(),
        }
    }
}

/// Failure reported by a worker.
#[derive(Debug)]
pub struct PoolError {
    /// Worker that ran the job.
    pub worker_id: usize,
    /// Job name.
    pub job: &'static str,
    /// The failure.
    pub error: StoreError,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PoolState {
    Created,
    Running,
    Halted,
}

/// Fixed set of threads polling the assigned jobs round-robin.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    jobs: Mutex<Vec<Arc<dyn Job>>>,
    state: Mutex<PoolState>,
    halt: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    errors_tx: Sender<PoolError>,
    errors_rx: Mutex<Receiver<PoolError>>,
}

impl WorkerPool {
    /// Creates a pool; no thread runs until [`WorkerPool::start`].
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel();
        Self {
            config,
            jobs: Mutex::new(Vec::new()),
            state: Mutex::new(PoolState::Created),
            halt: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
        }
    }

    /// Number of worker threads the pool runs.
    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Registers a job with every worker. Only allowed before `start`.
    pub fn assign(&self, job: Arc<dyn Job>) -> Result<()> {
        if *self.state.lock() != PoolState::Created {
            return Err(StoreError::Invalid(format!(
                "cannot assign job {} to a started pool",
                job.name()
            )));
        }
        self.jobs.lock().push(job);
        Ok(())
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PoolState::Created {
            return Err(StoreError::Invalid("worker pool already started".into()));
        }
        let jobs: Arc<[Arc<dyn Job>]> = self.jobs.lock().clone().into();
        let mut threads = self.threads.lock();
        for worker_id in 0..self.config.worker_count {
            let ctx = WorkerContext {
                worker_id,
                cpu: self.config.affinity.get(worker_id).copied().flatten(),
                jobs: Arc::clone(&jobs),
                halt: Arc::clone(&self.halt),
                halt_on_error: self.config.halt_on_error,
                idle: self.config.idle,
                errors: self.errors_tx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.config.name, worker_id))
                .spawn(move || ctx.run())
                .map_err(StoreError::from)?;
            threads.push(handle);
        }
        *state = PoolState::Running;
        info!(
            workers = self.config.worker_count,
            jobs = jobs.len(),
            "pool.started"
        );
        Ok(())
    }

    /// Whether the pool was asked to stop, by `halt` or by a failed job under `halt_on_error`.
    pub fn is_halting(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Stops the workers once they drained their queues and waits for them to exit.
    pub fn halt(&self) {
        let mut state = self.state.lock();
        if *state == PoolState::Halted {
            return;
        }
        self.halt.store(true, Ordering::Release);
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in &threads {
            handle.thread().unpark();
        }
        for handle in threads {
            if handle.join().is_err() {
                warn!("pool.worker.join_panicked");
            }
        }
        *state = PoolState::Halted;
        info!("pool.halted");
    }

    /// Takes every failure reported so far.
    pub fn drain_errors(&self) -> Vec<PoolError> {
        let rx = self.errors_rx.lock();
        rx.try_iter().collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.halt();
    }
}

struct WorkerContext {
    worker_id: usize,
    cpu: Option<usize>,
    jobs: Arc<[Arc<dyn Job>]>,
    halt: Arc<AtomicBool>,
    halt_on_error: bool,
    idle: IdleStrategy,
    errors: Sender<PoolError>,
}

impl WorkerContext {
    fn run(self) {
        if let Some(cpu) = self.cpu {
            match pin_current_thread(cpu) {
                Ok(()) => debug!(worker = self.worker_id, cpu, "pool.worker.pinned"),
                Err(err) => warn!(worker = self.worker_id, cpu, error = %err, "pool.worker.pin_failed"),
            }
        }
        debug!(worker = self.worker_id, "pool.worker.start");
        let mut idle_rounds = 0u32;
        loop {
            let halting = self.halt.load(Ordering::Acquire);
            let mut useful = false;
            for job in self.jobs.iter() {
                useful |= self.run_job(job.as_ref());
            }
            if useful {
                idle_rounds = 0;
                continue;
            }
            // Queues are drained once a full round found nothing after halt was raised.
            if halting {
                break;
            }
            self.idle.backoff(idle_rounds);
            idle_rounds = idle_rounds.saturating_add(1);
        }
        debug!(worker = self.worker_id, "pool.worker.exit");
    }

    fn run_job(&self, job: &dyn Job) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(self.worker_id)))
            .unwrap_or_else(|payload| {
                Err(StoreError::JobExecution {
                    stage: job.name(),
                    message: panic_message(payload.as_ref()),
                })
            });
        match outcome {
            Ok(useful) => useful,
            Err(err) => {
                error!(
                    worker = self.worker_id,
                    job = job.name(),
                    error = %err,
                    "pool.job.failed"
                );
                if self.halt_on_error {
                    self.halt.store(true, Ordering::Release);
                }
                let _ = self.errors.send(PoolError {
                    worker_id: self.worker_id,
                    job: job.name(),
                    error: err,
                });
                true
            }
        }
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
