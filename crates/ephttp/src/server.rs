//! Server startup and shutdown.

use crate::accumulator::AccumulatorPool;
use crate::config::ServerConfig;
use crate::driver::{ConnReactor, Driver, Shared, Task};
use crate::handler::Handler;
use crate::worker::WorkerPool;

use ephttp_core::error::{EpError, Result};
use ephttp_core::event::EventMask;
use ephttp_core::{kdebug, kerror, kinfo};
use ephttp_reactor::socket::{self, Listener};
use ephttp_reactor::Continuation;

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A bound listener plus everything needed to serve it.
///
/// ```rust,ignore
/// let server = Server::listen(":8080")?;
/// let stop = server.shutdown_handle();
/// server.start(|req: &Request<'_>, body: &mut BodySink<'_>| {
///     body.write_str(r#"{"ok":true}"#);
///     200
/// })?;
/// ```
pub struct Server {
    listener: Listener,
    reactor: Arc<ConnReactor>,
    pool: Arc<AccumulatorPool>,
    config: ServerConfig,
}

impl Server {
    /// Bind `addr` (`"host:port"` or `":port"`) with configuration taken
    /// from the environment.
    pub fn listen(addr: &str) -> Result<Self> {
        Self::with_config(addr, ServerConfig::from_env())
    }

    pub fn with_config(addr: &str, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = socket::listen(addr, config.backlog)?;
        let reactor = Arc::new(ConnReactor::create(config.poll_timeout)?);
        let pool = Arc::new(AccumulatorPool::new(
            config.pool_capacity,
            config.read_buffer_size,
        ));
        kinfo!("listening on {}", listener.local_addr());
        Ok(Self {
            listener,
            reactor,
            pool,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            reactor: Arc::clone(&self.reactor),
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            reactor: Arc::clone(&self.reactor),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Serve on the calling thread until [`ShutdownHandle::shutdown`].
    ///
    /// On return the listener is closed, in-flight requests have had the
    /// configured grace period, and every remaining connection is closed.
    pub fn start<H: Handler>(self, handler: H) -> Result<()> {
        let Server {
            listener,
            reactor,
            pool,
            config,
        } = self;

        let shared = Arc::new(Shared {
            reactor: Arc::clone(&reactor),
            pool,
            handler,
            server_name: config.server_name.clone(),
            max_request_size: config.max_request_size,
            write_retry_budget: config.write_retry_budget,
        });

        let worker_shared = Arc::clone(&shared);
        let workers = WorkerPool::new(config.workers, config.queue_depth, move |task: Task| {
            worker_shared.serve(task)
        })?;

        match reactor.register(listener.fd(), EventMask::LISTENER, Continuation::Accept) {
            Ok(()) => {}
            Err(EpError::Closed) => {
                kdebug!("shutdown requested before start");
                workers.shutdown(config.grace_period);
                return Ok(());
            }
            Err(e) => {
                workers.shutdown(config.grace_period);
                return Err(e);
            }
        }

        kinfo!(
            "serving {} with {} worker(s)",
            listener.local_addr(),
            workers.total_workers()
        );

        let mut driver = Driver {
            shared: &shared,
            workers: &workers,
            listener: listener.fd(),
        };
        let result = reactor.run(&mut driver);
        if let Err(ref e) = result {
            kerror!("reactor: {}", e);
        }

        // Loop has stopped: no new connections, no new dispatches.
        reactor.unregister(listener.fd());
        drop(listener);

        kinfo!(
            "shutting down: waiting up to {:?} for in-flight requests",
            config.grace_period
        );
        if !workers.shutdown(config.grace_period) {
            kinfo!("grace period elapsed with requests still running");
        }
        let swept = shared.sweep();
        kinfo!("shutdown complete ({} connection(s) closed)", swept);
        result
    }

    /// Run [`Server::start`] on a new thread named `ephttp-poll`.
    pub fn spawn<H: Handler>(self, handler: H) -> Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("ephttp-poll".to_string())
            .spawn(move || self.start(handler))
            .map_err(|e| {
                kerror!("failed to spawn polling thread: {}", e);
                EpError::Spawn
            })
    }
}

/// Stops a running (or not yet started) server from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    reactor: Arc<ConnReactor>,
}

impl ShutdownHandle {
    /// Idempotent.
    pub fn shutdown(&self) {
        if let Err(e) = self.reactor.close() {
            kerror!("shutdown: failed to wake reactor: {}", e);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.reactor.is_closed()
    }
}

/// Live counters for diagnostics.
#[derive(Clone)]
pub struct Stats {
    reactor: Arc<ConnReactor>,
    pool: Arc<AccumulatorPool>,
}

impl Stats {
    /// Registered descriptors, listener included while serving.
    pub fn registered(&self) -> usize {
        self.reactor.registered()
    }

    /// Accumulators currently held by connections.
    pub fn buffers_in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn buffers_idle(&self) -> usize {
        self.pool.idle()
    }

    pub fn buffers_allocated(&self) -> usize {
        self.pool.allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BodySink, Request};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn config() -> ServerConfig {
        ServerConfig::new()
            .workers(2)
            .queue_depth(64)
            .pool_capacity(16)
            .read_buffer_size(512)
            .max_request_size(4096)
            .grace_period(Duration::from_millis(200))
            .server_name("ephttp-test")
    }

    fn app(req: &Request<'_>, body: &mut BodySink<'_>) -> u16 {
        match req.url() {
            b"/ping" => {
                body.write_str(r#"{"ok":true}"#);
                200
            }
            b"/echo" => {
                body.write(req.body());
                200
            }
            b"/panic" => panic!("handler failure"),
            _ => 404,
        }
    }

    struct Running {
        addr: SocketAddrV4,
        stop: ShutdownHandle,
        stats: Stats,
        thread: JoinHandle<Result<()>>,
    }

    impl Running {
        fn start(config: ServerConfig) -> Self {
            let server = Server::with_config("127.0.0.1:0", config).unwrap();
            let addr = server.local_addr();
            let stop = server.shutdown_handle();
            let stats = server.stats();
            let thread = server.spawn(app).unwrap();
            Self {
                addr,
                stop,
                stats,
                thread,
            }
        }

        fn connect(&self) -> TcpStream {
            let s = TcpStream::connect(self.addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            s
        }

        fn stop(self) {
            self.stop.shutdown();
            self.thread.join().unwrap().unwrap();
        }
    }

    /// Read one response: head plus exactly `Content-Length` body bytes.
    fn read_response(s: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            let n = s.read(&mut byte).unwrap();
            assert_eq!(n, 1, "connection closed mid-head: {:?}", String::from_utf8_lossy(&buf));
            buf.push(byte[0]);
        }
        let head = String::from_utf8(buf).unwrap();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut body = vec![0u8; len];
        s.read_exact(&mut body).unwrap();
        (head, body)
    }

    fn assert_eof(s: &mut TcpStream) {
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty(), "unexpected bytes: {:?}", String::from_utf8_lossy(&rest));
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_ping_keep_alive() {
        let srv = Running::start(config());
        let mut s = srv.connect();

        for _ in 0..3 {
            s.write_all(b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut s);
            assert_eq!(
                head,
                "HTTP/1.1 200 OK\r\nServer: ephttp-test\r\nContent-Length: 11\r\n\
                 Connection: keep-alive\r\nContent-Type: application/json\r\n\r\n"
            );
            assert_eq!(body, br#"{"ok":true}"#);
        }

        drop(s);
        srv.stop();
    }

    #[test]
    fn test_pipelined_requests() {
        let srv = Running::start(config());
        let mut s = srv.connect();
        s.write_all(
            b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();

        let (head, _) = read_response(&mut s);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let (head, body) = read_response(&mut s);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(body, b"404 Not Found\n");

        drop(s);
        srv.stop();
    }

    #[test]
    fn test_close_without_keep_alive() {
        let srv = Running::start(config());
        let mut s = srv.connect();
        s.write_all(b"GET /ping HTTP/1.1\r\n\r\n").unwrap();
        let (head, _) = read_response(&mut s);
        assert!(head.contains("Connection: close\r\n"));
        assert_eof(&mut s);

        assert!(wait_until(|| srv.stats.buffers_in_use() == 0));
        srv.stop();
    }

    #[test]
    fn test_peer_close_releases_buffer() {
        let srv = Running::start(config());
        {
            let mut s = srv.connect();
            s.write_all(b"GET /pi").unwrap();
            assert!(wait_until(|| srv.stats.buffers_in_use() == 1));
        }
        assert!(wait_until(|| srv.stats.buffers_in_use() == 0));
        // Only the listener is left.
        assert!(wait_until(|| srv.stats.registered() == 1));

        {
            let _idle = srv.connect();
        }
        assert!(wait_until(
            || srv.stats.registered() == 1 && srv.stats.buffers_in_use() == 0
        ));
        srv.stop();
    }

    #[test]
    fn test_split_request() {
        let srv = Running::start(config());
        let mut s = srv.connect();
        s.set_nodelay(true).unwrap();
        s.write_all(b"GET /ping HT").unwrap();
        thread::sleep(Duration::from_millis(30));
        s.write_all(b"TP/1.1\r\nConnection: keep-al").unwrap();
        thread::sleep(Duration::from_millis(30));
        s.write_all(b"ive\r\n\r\n").unwrap();

        let (head, body) = read_response(&mut s);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, br#"{"ok":true}"#);
        drop(s);
        srv.stop();
    }

    #[test]
    fn test_content_length_body() {
        let srv = Running::start(config());
        let mut s = srv.connect();
        s.write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 9\r\nConnection: keep-alive\r\n\r\n[1,2,3,4]")
            .unwrap();
        let (_, body) = read_response(&mut s);
        assert_eq!(body, b"[1,2,3,4]");
        drop(s);
        srv.stop();
    }

    #[test]
    fn test_oversized_request_rejected() {
        let srv = Running::start(config().max_request_size(1024));
        let mut s = srv.connect();
        let mut req = b"GET /ping HTTP/1.1\r\nX-Fill: ".to_vec();
        req.extend(std::iter::repeat(b'a').take(2048));
        s.write_all(&req).unwrap();

        let (head, body) = read_response(&mut s);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(body, b"400 Bad Request\n");
        srv.stop();
    }

    #[test]
    fn test_handler_panic_closes_only_that_connection() {
        let srv = Running::start(config());
        let mut bad = srv.connect();
        let mut good = srv.connect();

        bad.write_all(b"GET /panic HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert_eof(&mut bad);

        good.write_all(b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut good);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

        drop(good);
        srv.stop();
    }

    #[test]
    fn test_shutdown_unblocks_start_and_closes_connections() {
        let srv = Running::start(config());
        let mut idle = srv.connect();
        idle.write_all(b"GET /ping HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        read_response(&mut idle);

        let stop = srv.stop.clone();
        let stats = srv.stats.clone();
        srv.stop();
        assert!(stop.is_shutdown());
        assert_eq!(stats.registered(), 0);
        assert_eq!(stats.buffers_in_use(), 0);
        assert_eof(&mut idle);
    }

    #[test]
    fn test_shutdown_before_start() {
        let server = Server::with_config("127.0.0.1:0", config()).unwrap();
        server.shutdown_handle().shutdown();
        assert!(server.start(app).is_ok());
    }

    #[test]
    fn test_invalid_config_refused() {
        assert_eq!(
            Server::with_config("127.0.0.1:0", config().workers(0)).err(),
            Some(EpError::Config("workers must be > 0"))
        );
    }
}
