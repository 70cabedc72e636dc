//! Server configuration
//!
//! Library defaults live in [`defaults`]; every field can be overridden
//! from the environment.
//!
//! # Example
//!
//! ```rust,ignore
//! use ephttp::config::ServerConfig;
//!
//! let config = ServerConfig::from_env()
//!     .workers(4)
//!     .grace_period(Duration::from_millis(500));
//! config.validate()?;
//! ```

pub mod defaults;

use ephttp_core::env::{env_get, env_get_millis, env_get_str};
use ephttp_core::error::{EpError, Result};

use std::time::Duration;

/// Tunables for one `Server`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `listen()` backlog
    pub backlog: i32,
    /// Bound on each `epoll_wait`; `None` waits indefinitely
    pub poll_timeout: Option<Duration>,
    /// Per-connection read scratch size
    pub read_buffer_size: usize,
    /// Largest request accumulated before answering 400
    pub max_request_size: usize,
    /// EAGAIN retries per response write
    pub write_retry_budget: u32,
    /// Handler worker threads
    pub workers: usize,
    /// Worker queue capacity
    pub queue_depth: usize,
    /// Idle accumulators kept for reuse
    pub pool_capacity: usize,
    /// Time given to in-flight requests at shutdown
    pub grace_period: Duration,
    /// `Server:` response header
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `EPHTTP_BACKLOG`
    /// - `EPHTTP_POLL_TIMEOUT_MS` - negative waits indefinitely
    /// - `EPHTTP_READ_BUFFER`
    /// - `EPHTTP_MAX_REQUEST`
    /// - `EPHTTP_WRITE_RETRIES`
    /// - `EPHTTP_WORKERS`
    /// - `EPHTTP_QUEUE_DEPTH`
    /// - `EPHTTP_POOL_CAPACITY`
    /// - `EPHTTP_GRACE_MS`
    /// - `EPHTTP_SERVER_NAME`
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            backlog: env_get("EPHTTP_BACKLOG", base.backlog),
            poll_timeout: env_get_millis("EPHTTP_POLL_TIMEOUT_MS", base.poll_timeout),
            read_buffer_size: env_get("EPHTTP_READ_BUFFER", base.read_buffer_size),
            max_request_size: env_get("EPHTTP_MAX_REQUEST", base.max_request_size),
            write_retry_budget: env_get("EPHTTP_WRITE_RETRIES", base.write_retry_budget),
            workers: env_get("EPHTTP_WORKERS", base.workers),
            queue_depth: env_get("EPHTTP_QUEUE_DEPTH", base.queue_depth),
            pool_capacity: env_get("EPHTTP_POOL_CAPACITY", base.pool_capacity),
            grace_period: Duration::from_millis(env_get(
                "EPHTTP_GRACE_MS",
                defaults::GRACE_PERIOD_MS,
            )),
            server_name: env_get_str("EPHTTP_SERVER_NAME", &base.server_name),
        }
    }

    /// Library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            backlog: defaults::BACKLOG,
            poll_timeout: millis(defaults::POLL_TIMEOUT_MS),
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            max_request_size: defaults::MAX_REQUEST_SIZE,
            write_retry_budget: defaults::WRITE_RETRY_BUDGET,
            workers: defaults::workers(),
            queue_depth: defaults::QUEUE_DEPTH,
            pool_capacity: defaults::POOL_CAPACITY,
            grace_period: Duration::from_millis(defaults::GRACE_PERIOD_MS),
            server_name: defaults::SERVER_NAME.to_string(),
        }
    }

    // Builder methods

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn poll_timeout(mut self, d: Option<Duration>) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    pub fn max_request_size(mut self, n: usize) -> Self {
        self.max_request_size = n;
        self
    }

    pub fn write_retry_budget(mut self, n: u32) -> Self {
        self.write_retry_budget = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.queue_depth = n;
        self
    }

    pub fn pool_capacity(mut self, n: usize) -> Self {
        self.pool_capacity = n;
        self
    }

    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            return Err(EpError::Config("backlog must be > 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(EpError::Config("read_buffer_size must be > 0"));
        }
        if self.max_request_size < self.read_buffer_size {
            return Err(EpError::Config(
                "max_request_size must be >= read_buffer_size",
            ));
        }
        if self.workers == 0 {
            return Err(EpError::Config("workers must be > 0"));
        }
        if self.workers > 256 {
            return Err(EpError::Config("workers must be <= 256"));
        }
        if self.queue_depth == 0 {
            return Err(EpError::Config("queue_depth must be > 0"));
        }
        if self.pool_capacity == 0 {
            return Err(EpError::Config("pool_capacity must be > 0"));
        }
        if self.server_name.is_empty() || self.server_name.contains(['\r', '\n']) {
            return Err(EpError::Config("server_name must be a non-empty header value"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("ephttp configuration:");
        eprintln!("  backlog:             {}", self.backlog);
        eprintln!("  poll_timeout:        {:?}", self.poll_timeout);
        eprintln!("  read_buffer_size:    {}", self.read_buffer_size);
        eprintln!("  max_request_size:    {}", self.max_request_size);
        eprintln!("  write_retry_budget:  {}", self.write_retry_budget);
        eprintln!("  workers:             {}", self.workers);
        eprintln!("  queue_depth:         {}", self.queue_depth);
        eprintln!("  pool_capacity:       {}", self.pool_capacity);
        eprintln!("  grace_period:        {:?}", self.grace_period);
        eprintln!("  server_name:         {}", self.server_name);
    }
}

fn millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.poll_timeout, None);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.grace_period, Duration::from_secs(2));
        assert!((2..=8).contains(&config.workers));
        assert!(config.server_name.starts_with("ephttp/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("EPHTTP_QUEUE_DEPTH", "77");
        std::env::set_var("EPHTTP_POLL_TIMEOUT_MS", "250");
        let config = ServerConfig::from_env();
        std::env::remove_var("EPHTTP_QUEUE_DEPTH");
        std::env::remove_var("EPHTTP_POLL_TIMEOUT_MS");

        assert_eq!(config.queue_depth, 77);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new()
            .workers(3)
            .poll_timeout(Some(Duration::from_millis(5)))
            .server_name("unit/1");

        assert_eq!(config.workers, 3);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(5)));
        assert_eq!(config.server_name, "unit/1");
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::new().workers(0).validate().is_err());
        assert!(ServerConfig::new().workers(1000).validate().is_err());
        assert!(ServerConfig::new().backlog(0).validate().is_err());
        assert!(ServerConfig::new()
            .read_buffer_size(8192)
            .max_request_size(4096)
            .validate()
            .is_err());
        assert_eq!(
            ServerConfig::new().server_name("a\r\nb").validate(),
            Err(EpError::Config("server_name must be a non-empty header value"))
        );
    }

    #[test]
    fn test_millis() {
        assert_eq!(millis(-1), None);
        assert_eq!(millis(0), Some(Duration::ZERO));
    }
}
