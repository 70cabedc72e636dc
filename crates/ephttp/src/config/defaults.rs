//! Library defaults for `ServerConfig`.

/// `listen()` backlog.
pub const BACKLOG: i32 = 1024;

/// `epoll_wait` timeout in milliseconds; negative waits indefinitely.
pub const POLL_TIMEOUT_MS: i64 = -1;

/// Per-connection read scratch.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Accumulated request bytes allowed before answering 400.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// EAGAIN retries a single response write may spend.
pub const WRITE_RETRY_BUDGET: u32 = 64;

pub const MIN_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 8;

pub const QUEUE_DEPTH: usize = 16384;

/// Idle accumulators kept by the pool.
pub const POOL_CAPACITY: usize = 4096;

/// Time given to in-flight requests at shutdown.
pub const GRACE_PERIOD_MS: u64 = 2000;

pub const SERVER_NAME: &str = crate::framer::DEFAULT_SERVER_NAME;

/// Half the CPUs, clamped to `[MIN_WORKERS, MAX_WORKERS]`.
pub fn workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS);
    (cpus / 2).clamp(MIN_WORKERS, MAX_WORKERS)
}
