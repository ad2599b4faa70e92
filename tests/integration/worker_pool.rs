#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chronocol::primitives::concurrency::{Job, JobQueue, WorkerPool, WorkerPoolConfig};
use chronocol::types::{Result, StoreError};
use parking_lot::Mutex;

/// Squares queued numbers; panics on 13.
struct SquareJob {
    queue: JobQueue<u64>,
    sum: AtomicUsize,
    workers: Mutex<HashSet<usize>>,
}

impl SquareJob {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: JobQueue::new("squares", capacity),
            sum: AtomicUsize::new(0),
            workers: Mutex::new(HashSet::new()),
        })
    }
}

impl Job for SquareJob {
    fn name(&self) -> &'static str {
        "squares"
    }

    fn run(&self, worker_id: usize) -> Result<bool> {
        let Some(n) = self.queue.try_claim() else {
            return Ok(false);
        };
        self.workers.lock().insert(worker_id);
        if n == 13 {
            panic!("unlucky {n}");
        }
        self.sum.fetch_add((n * n) as usize, Ordering::SeqCst);
        Ok(true)
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn panicking_job_is_reported_and_the_worker_survives() -> Result<()> {
    let job = SquareJob::new(64);
    let pool = WorkerPool::new(WorkerPoolConfig {
        worker_count: 1,
        ..WorkerPoolConfig::default()
    });
    pool.assign(job.clone())?;
    pool.start()?;
    for n in [2, 13, 3] {
        job.queue.publish_timeout(n, Duration::from_secs(1)).unwrap();
    }
    wait_until(|| job.queue.is_empty());
    pool.halt();

    assert_eq!(job.sum.load(Ordering::SeqCst), 13);
    let errors = pool.drain_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].worker_id, 0);
    assert_eq!(errors[0].job, "squares");
    match &errors[0].error {
        StoreError::JobExecution { stage, message } => {
            assert_eq!(*stage, "squares");
            assert!(message.contains("unlucky 13"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(pool.drain_errors().is_empty());
    Ok(())
}

#[test]
fn blocked_producers_feed_every_worker_until_halt() -> Result<()> {
    let job = SquareJob::new(4);
    let pool = WorkerPool::new(WorkerPoolConfig {
        worker_count: 4,
        affinity: vec![None, Some(0), None],
        ..WorkerPoolConfig::default()
    });
    pool.assign(job.clone())?;
    pool.start()?;

    let producers: Vec<_> = (0..3u64)
        .map(|p| {
            let job = Arc::clone(&job);
            thread::spawn(move || {
                for n in 0..200u64 {
                    let mut item = p * 1_000 + n;
                    if item == 13 {
                        item = 0;
                    }
                    while let Err(back) = job.queue.publish_timeout(item, Duration::from_millis(5)) {
                        item = back;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer");
    }
    pool.halt();

    let expected: u64 = (0..3u64)
        .flat_map(|p| (0..200u64).map(move |n| p * 1_000 + n))
        .filter(|&item| item != 13)
        .map(|item| item * item)
        .sum();
    assert_eq!(job.sum.load(Ordering::SeqCst) as u64, expected);
    assert!(job.queue.is_empty());
    assert!(pool.drain_errors().is_empty());
    assert!(job.workers.lock().iter().all(|&w| w < 4));
    Ok(())
}

#[test]
fn several_jobs_share_the_same_workers() -> Result<()> {
    let first = SquareJob::new(128);
    let second = SquareJob::new(128);
    let pool = WorkerPool::new(WorkerPoolConfig {
        worker_count: 2,
        ..WorkerPoolConfig::default()
    });
    pool.assign(first.clone())?;
    pool.assign(second.clone())?;
    for n in 1..=100 {
        first.queue.try_publish(n).unwrap();
        second.queue.try_publish(2 * n).unwrap();
    }
    pool.start()?;
    pool.halt();
    assert!(pool.is_halting());
    let squares: usize = (1..=100).map(|n: usize| n * n).sum();
    // 13 panics in `first` and is reported instead of summed.
    assert_eq!(first.sum.load(Ordering::SeqCst), squares - 13 * 13);
    assert_eq!(second.sum.load(Ordering::SeqCst), 4 * squares);
    assert!(first.queue.is_empty());
    assert!(second.queue.is_empty());
    let errors = pool.drain_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].job, "squares");
    Ok(())
}
