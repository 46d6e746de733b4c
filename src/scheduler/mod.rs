//! A persistent worker pool.
//!
//! N workers block on a condition variable until a batch is published,
//! claim jobs with an atomic cursor, and signal a second condition
//! variable when the last job completes. Per-worker state is built once
//! by an init closure when the thread starts and handed mutably to every
//! job the worker claims.
//!
//! The claim cursor carries the batch epoch in its high half: a worker
//! that lingers past the end of a batch can never steal a job from the
//! next one, because its compare-exchange fails the moment the epoch
//! advances.

pub mod tiled;

pub use self::tiled::{FrameParams, TiledRenderer, WorkerVm};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

type Job<W> = Arc<dyn Fn(u32, &mut W) + Send + Sync>;

struct BatchState<W> {
    job: Option<Job<W>>,
    total: u32,
    epoch: u32,
}

struct Shared<W> {
    state: Mutex<BatchState<W>>,
    work_cond: Condvar,
    done_cond: Condvar,
    /// `epoch << 32 | next_job`.
    cursor: AtomicU64,
    completed: AtomicU32,
    running: AtomicBool,
}

fn cursor_epoch(cur: u64) -> u32 {
    (cur >> 32) as u32
}

fn cursor_index(cur: u64) -> u32 {
    (cur & 0xffff_ffff) as u32
}

pub struct WorkerPool<W: Send + 'static> {
    shared: Arc<Shared<W>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl<W: Send + 'static> WorkerPool<W> {
    /// Spawns `num_threads` workers (0 picks the CPU count). `init` runs
    /// once on each worker thread to build its local state.
    pub fn new<F>(num_threads: usize, init: F) -> Self
    where
        F: Fn(usize) -> W + Send + Sync + 'static,
    {
        let n = if num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_threads
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(BatchState {
                job: None,
                total: 0,
                epoch: 0,
            }),
            work_cond: Condvar::new(),
            done_cond: Condvar::new(),
            cursor: AtomicU64::new(0),
            completed: AtomicU32::new(0),
            running: AtomicBool::new(true),
        });
        let init = Arc::new(init);
        let threads = (0..n)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let init = Arc::clone(&init);
                thread::Builder::new()
                    .name(format!("mathflow-worker-{}", i))
                    .spawn(move || {
                        let local = init(i);
                        worker_loop(shared, local);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        debug!("worker pool started with {} threads", n);
        WorkerPool { shared, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Publishes a batch and blocks until every job has completed. Jobs
    /// within the batch run in no particular order; the return is a
    /// happens-before barrier.
    pub fn run<F>(&self, job_count: u32, job: F)
    where
        F: Fn(u32, &mut W) + Send + Sync + 'static,
    {
        if job_count == 0 {
            return;
        }
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();
        state.epoch = state.epoch.wrapping_add(1);
        state.job = Some(Arc::new(job));
        state.total = job_count;
        shared.completed.store(0, Ordering::SeqCst);
        shared
            .cursor
            .store(u64::from(state.epoch) << 32, Ordering::SeqCst);
        shared.work_cond.notify_all();

        while shared.completed.load(Ordering::SeqCst) < job_count {
            state = shared.done_cond.wait(state).unwrap();
        }
        state.job = None;
    }
}

impl<W: Send + 'static> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let _state = self.shared.state.lock().unwrap();
            self.shared.work_cond.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Claims the next job of `epoch`, or `None` once the batch is drained
/// or superseded.
fn claim<W>(shared: &Shared<W>, epoch: u32, total: u32) -> Option<u32> {
    loop {
        let cur = shared.cursor.load(Ordering::SeqCst);
        if cursor_epoch(cur) != epoch {
            return None;
        }
        let idx = cursor_index(cur);
        if idx >= total {
            return None;
        }
        if shared
            .cursor
            .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(idx);
        }
    }
}

fn worker_loop<W>(shared: Arc<Shared<W>>, mut local: W) {
    loop {
        // Wait for a batch with unclaimed jobs, or for teardown.
        let (job, total, epoch) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                let cur = shared.cursor.load(Ordering::SeqCst);
                let pending = state.job.is_some()
                    && cursor_epoch(cur) == state.epoch
                    && cursor_index(cur) < state.total;
                if pending {
                    break;
                }
                state = shared.work_cond.wait(state).unwrap();
            }
            (state.job.clone().unwrap(), state.total, state.epoch)
        };

        while let Some(id) = claim(&shared, epoch, total) {
            job(id, &mut local);
            let done = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
            if done == total {
                // The lock pairs the notification with the caller's wait.
                let _state = shared.state.lock().unwrap();
                shared.done_cond.notify_all();
            }
        }
    }
}
