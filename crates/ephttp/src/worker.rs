//! `WorkerPool`: fixed set of handler threads.
//!
//! Spawns N OS threads at creation. Tasks go through a bounded lock-free
//! MPMC queue; `submit` fails instead of blocking when it is full. Idle
//! workers park and advertise themselves on a second queue so a submit can
//! unpark one directly.
//!
//! No dynamic scaling.

use ephttp_core::error::{EpError, Result};
use ephttp_core::{kdebug, kerror};

use crossbeam_queue::ArrayQueue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Backstop for a missed unpark.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

type Exec<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

struct PoolInner<T> {
    work_queue: ArrayQueue<T>,
    /// Indices of workers about to park.
    sleepers: ArrayQueue<usize>,
    threads: Vec<Thread>,
    /// Number of workers currently running a task.
    active: AtomicUsize,
    /// No new work; workers exit once the queue is empty.
    shutdown: AtomicBool,
}

pub struct WorkerPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    total: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool of `n` workers running `exec` on every submitted task.
    ///
    /// `queue_depth`: max pending tasks before `submit` fails.
    pub fn new<F>(n: usize, queue_depth: usize, exec: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let n = n.max(1);
        let exec: Exec<T> = Arc::new(exec);

        // Workers need the shared state before their own handles exist, so
        // they wait on a start latch until `threads` is filled in.
        let (tx, rx) = std::sync::mpsc::channel::<Arc<PoolInner<T>>>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let exec = Arc::clone(&exec);
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("ephttp-worker-{}", worker_id))
                .spawn(move || {
                    let inner = rx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .recv();
                    if let Ok(inner) = inner {
                        worker_loop(inner, worker_id, exec);
                    }
                });
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    kerror!("worker spawn failed: {}", e);
                    // Dropping `tx` releases the workers already started.
                    return Err(EpError::Spawn);
                }
            }
        }

        let inner = Arc::new(PoolInner {
            work_queue: ArrayQueue::new(queue_depth.max(1)),
            sleepers: ArrayQueue::new(n),
            threads: handles.iter().map(|h| h.thread().clone()).collect(),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        for _ in 0..n {
            // Each worker is blocked in `recv` waiting for exactly one of these.
            let _ = tx.send(Arc::clone(&inner));
        }

        Ok(Self {
            inner,
            handles: Mutex::new(handles),
            total: n,
        })
    }

    /// Queue a task. Gives the task back if the queue is full or the pool
    /// is shutting down.
    pub fn submit(&self, task: T) -> std::result::Result<(), T> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        self.inner.work_queue.push(task)?;
        if let Some(id) = self.inner.sleepers.pop() {
            self.inner.threads[id].unpark();
        }
        Ok(())
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.inner.work_queue.len()
    }

    pub fn total_workers(&self) -> usize {
        self.total
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work and give queued and running tasks up to `grace`
    /// to finish. Returns `true` when every worker exited in time; workers
    /// still busy after that are left detached.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.inner.shutdown.store(true, Ordering::Release);
        for t in &self.inner.threads {
            t.unpark();
        }

        let mut handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let deadline = Instant::now() + grace;
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let mut all_done = true;
        for h in handles.drain(..) {
            if h.is_finished() {
                let _ = h.join();
            } else {
                all_done = false;
            }
        }
        if !all_done {
            kdebug!(
                "worker pool: {} task(s) still running after {:?}",
                self.active_workers(),
                grace
            );
        }
        all_done
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for t in &self.inner.threads {
            t.unpark();
        }
        // Not joined: a stuck task must not block the dropping thread.
    }
}

/// Worker thread main loop.
fn worker_loop<T>(inner: Arc<PoolInner<T>>, worker_id: usize, exec: Exec<T>) {
    loop {
        match inner.work_queue.pop() {
            Some(task) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                if panic::catch_unwind(AssertUnwindSafe(|| exec(task))).is_err() {
                    kerror!("worker {}: task panicked", worker_id);
                }
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    break;
                }
                let _ = inner.sleepers.push(worker_id);
                // Re-check so a submit racing the push above is not missed.
                if inner.work_queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
                    thread::park_timeout(PARK_TIMEOUT);
                }
            }
        }
    }
}
