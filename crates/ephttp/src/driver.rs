//! Connection lifecycle.
//!
//! ```text
//!   Accepted ─► Reading ─► Dispatching ─► Writing ─┬─► Re-armed ─► Reading
//!                 │            │              │    └─► (complete request buffered) ─► Dispatching
//!                 └────────────┴──────────────┴──────► Closed
//! ```
//!
//! Accept, read and framing run on the polling thread inside
//! [`Driver::dispatch`]. Handler invocation and the response write run on
//! the worker pool in [`Shared::serve`]. Every connection is registered
//! one-shot, so at most one of the two is touching it at any time; the
//! per-connection mutex is therefore uncontended except during shutdown.

use crate::accumulator::{Accumulator, AccumulatorPool};
use crate::framer::{try_parse, Parse};
use crate::handler::Handler;
use crate::worker::WorkerPool;

use ephttp_core::event::EventMask;
use ephttp_core::{kdebug, kerror, ktrace, kwarn};
use ephttp_reactor::socket::{self, ReadOutcome};
use ephttp_reactor::{Continuation, Dispatch, Reactor, Ready};

use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

pub type ConnReactor = Reactor<Arc<Connection>>;

/// One accepted client socket.
#[derive(Debug)]
pub struct Connection {
    fd: RawFd,
    /// Present while a request is being accumulated or served.
    state: Mutex<Option<Accumulator>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Accumulator>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unregister, close the descriptor and give the accumulator back.
    /// Only the first call does anything.
    fn close(&self, slot: &mut Option<Accumulator>, reactor: &ConnReactor, pool: &AccumulatorPool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        reactor.unregister(self.fd);
        socket::close(self.fd);
        if let Some(acc) = slot.take() {
            pool.release(acc);
        }
        ktrace!("conn fd={} closed", self.fd);
    }

    /// Close from outside the normal flow (shutdown sweep). A worker still
    /// holding the connection gets its socket shut down instead, so its
    /// write fails and it closes the connection itself.
    pub(crate) fn abort(&self, reactor: &ConnReactor, pool: &AccumulatorPool) {
        match self.state.try_lock() {
            Ok(mut slot) => self.close(&mut slot, reactor, pool),
            Err(TryLockError::Poisoned(p)) => self.close(&mut p.into_inner(), reactor, pool),
            Err(TryLockError::WouldBlock) => unsafe {
                libc::shutdown(self.fd, libc::SHUT_RDWR);
            },
        }
    }
}

/// Work handed from the polling thread to a worker.
pub(crate) struct Task {
    conn: Arc<Connection>,
    job: Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    /// A complete request is framed in the accumulator.
    Serve,
    /// Answer 400 and close.
    Reject,
}

/// What a connection does once the current exchange is over.
#[derive(Debug, PartialEq, Eq)]
enum After {
    Rearm,
    Close,
}

/// State shared by the polling thread and every worker.
pub(crate) struct Shared<H> {
    pub(crate) reactor: Arc<ConnReactor>,
    pub(crate) pool: Arc<AccumulatorPool>,
    pub(crate) handler: H,
    pub(crate) server_name: String,
    pub(crate) max_request_size: usize,
    pub(crate) write_retry_budget: u32,
}

impl<H: Handler> Shared<H> {
    /// Worker entry point.
    pub(crate) fn serve(&self, task: Task) {
        let conn = task.conn;
        let mut slot = conn.lock();
        if conn.is_closed() {
            return;
        }
        let after = match slot.as_mut() {
            Some(acc) => self.exchange(conn.fd, acc, task.job),
            None => After::Close,
        };
        self.finish(&conn, &mut slot, after);
    }

    /// Write responses until the connection has to wait for more bytes or
    /// be closed.
    fn exchange(&self, fd: RawFd, acc: &mut Accumulator, mut job: Job) -> After {
        loop {
            if job == Job::Reject {
                let _ = self.reply(fd, acc, 400, false);
                return After::Close;
            }

            let status = match panic::catch_unwind(AssertUnwindSafe(|| acc.invoke(&self.handler))) {
                Ok(Some(status)) => status,
                Ok(None) => return After::Close,
                Err(_) => {
                    kerror!("conn fd={}: handler panicked, closing", fd);
                    return After::Close;
                }
            };

            let keep_alive = acc.keep_alive();
            if self.reply(fd, acc, status, keep_alive).is_err() || !keep_alive {
                return After::Close;
            }

            acc.next_request();
            job = match self.frame(acc) {
                Framed::Ready => Job::Serve,
                Framed::Reject => Job::Reject,
                Framed::Wait => return After::Rearm,
            };
        }
    }

    fn reply(&self, fd: RawFd, acc: &mut Accumulator, status: u16, keep_alive: bool) -> Result<(), ()> {
        let bytes = acc.respond(status, keep_alive, &self.server_name);
        socket::write_all(fd, bytes, self.write_retry_budget).map_err(|e| {
            kdebug!("conn fd={}: write failed: {}", fd, e);
        })
    }

    /// Try to frame the next request from what is already buffered.
    fn frame(&self, acc: &mut Accumulator) -> Framed {
        match try_parse(acc.request_bytes()) {
            Parse::Complete(head) if head.consumed() <= self.max_request_size => {
                acc.set_head(head);
                Framed::Ready
            }
            Parse::Complete(_) | Parse::Invalid => Framed::Reject,
            Parse::Incomplete if acc.pending() > self.max_request_size => Framed::Reject,
            Parse::Incomplete => Framed::Wait,
        }
    }

    fn finish(&self, conn: &Connection, slot: &mut Option<Accumulator>, after: After) {
        match after {
            After::Close => conn.close(slot, &self.reactor, &self.pool),
            After::Rearm => {
                if slot.as_ref().is_some_and(|acc| acc.pending() == 0) {
                    if let Some(acc) = slot.take() {
                        self.pool.release(acc);
                    }
                }
                if let Err(e) = self.reactor.rearm(conn.fd) {
                    kdebug!("conn fd={}: rearm failed: {}", conn.fd, e);
                    conn.close(slot, &self.reactor, &self.pool);
                }
            }
        }
    }

    /// Polling-thread side of a readable connection.
    fn on_readable(&self, conn: &Arc<Connection>, workers: &WorkerPool<Task>) {
        let mut slot = conn.lock();
        if conn.is_closed() {
            return;
        }
        let acc = slot.get_or_insert_with(|| self.pool.acquire());

        match acc.fill(conn.fd) {
            ReadOutcome::Failed(errno) => {
                kdebug!(
                    "conn fd={}: read failed: {}",
                    conn.fd,
                    std::io::Error::from_raw_os_error(errno)
                );
                conn.close(&mut slot, &self.reactor, &self.pool);
                return;
            }
            ReadOutcome::PeerClosed if acc.pending() == 0 => {
                conn.close(&mut slot, &self.reactor, &self.pool);
                return;
            }
            _ => {}
        }

        if acc.pending() == 0 {
            // Spurious wakeup: nothing worth holding a buffer for.
            self.finish(conn, &mut slot, After::Rearm);
            return;
        }

        let job = match self.frame(acc) {
            Framed::Ready => Job::Serve,
            Framed::Reject => Job::Reject,
            Framed::Wait if acc.peer_closed() => {
                conn.close(&mut slot, &self.reactor, &self.pool);
                return;
            }
            Framed::Wait => {
                self.finish(conn, &mut slot, After::Rearm);
                return;
            }
        };
        drop(slot);

        let task = Task {
            conn: Arc::clone(conn),
            job,
        };
        if let Err(task) = workers.submit(task) {
            kwarn!("conn fd={}: worker queue full, closing", conn.fd);
            let mut slot = task.conn.lock();
            task.conn.close(&mut slot, &self.reactor, &self.pool);
        }
    }

    fn admit(&self, reactor: &ConnReactor, fd: RawFd) {
        if let Err(e) = socket::set_low_latency(fd) {
            kdebug!("conn fd={}: set_low_latency: {}", fd, e);
        }
        let conn = Arc::new(Connection::new(fd));
        if let Err(e) = reactor.register(fd, EventMask::CONNECTION, Continuation::Drive(conn)) {
            kdebug!("conn fd={}: register failed: {}", fd, e);
            socket::close(fd);
            return;
        }
        ktrace!("conn fd={} accepted", fd);
    }

    /// Close every connection still registered. Used once the loop has
    /// stopped and the workers had their grace period.
    pub(crate) fn sweep(&self) -> usize {
        let mut swept = 0;
        for (_, continuation) in self.reactor.drain_registrations() {
            if let Continuation::Drive(conn) = continuation {
                conn.abort(&self.reactor, &self.pool);
                swept += 1;
            }
        }
        swept
    }
}

enum Framed {
    Ready,
    Reject,
    Wait,
}

/// Polling-thread dispatcher handed to `Reactor::run`.
pub(crate) struct Driver<'a, H> {
    pub(crate) shared: &'a Shared<H>,
    pub(crate) workers: &'a WorkerPool<Task>,
    pub(crate) listener: RawFd,
}

impl<H: Handler> Dispatch<Arc<Connection>> for Driver<'_, H> {
    fn dispatch(&mut self, reactor: &ConnReactor, ready: Ready<Arc<Connection>>) {
        match ready.continuation {
            Continuation::Accept => {
                let shared = self.shared;
                if let Err(e) = socket::accept_drain(self.listener, |fd| shared.admit(reactor, fd)) {
                    kwarn!("accept stopped: {}", e);
                }
            }
            Continuation::Drive(conn) => self.shared.on_readable(&conn, self.workers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn shared<H: Handler>(handler: H) -> Shared<H> {
        Shared {
            reactor: Arc::new(ConnReactor::create(Some(Duration::from_millis(10))).unwrap()),
            pool: Arc::new(AccumulatorPool::new(8, 64)),
            handler,
            server_name: "unit".to_string(),
            max_request_size: 256,
            write_retry_budget: 8,
        }
    }

    fn read_all(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        socket::read_drain(fd, &mut buf, |c| out.extend_from_slice(c));
        out
    }

    fn ok(_: &crate::Request<'_>, body: &mut crate::BodySink<'_>) -> u16 {
        body.write_str("{}");
        200
    }

    #[test]
    fn test_close_runs_once() {
        let s = shared(ok);
        let (a, b) = socketpair();
        let conn = Arc::new(Connection::new(a));
        s.reactor
            .register(a, EventMask::CONNECTION, Continuation::Drive(Arc::clone(&conn)))
            .unwrap();

        let mut slot = Some(s.pool.acquire());
        conn.close(&mut slot, &s.reactor, &s.pool);
        conn.close(&mut slot, &s.reactor, &s.pool);
        conn.abort(&s.reactor, &s.pool);

        assert!(conn.is_closed());
        assert!(!s.reactor.is_registered(a));
        assert_eq!(s.pool.in_use(), 0);
        assert_eq!(s.pool.idle(), 1);
        socket::close(b);
    }

    #[test]
    fn test_serve_pipelined_then_rearm() {
        let s = shared(ok);
        let (a, b) = socketpair();
        let conn = Arc::new(Connection::new(a));
        s.reactor
            .register(a, EventMask::CONNECTION, Continuation::Drive(Arc::clone(&conn)))
            .unwrap();

        socket::write_all(
            b,
            b"GET /1 HTTP/1.1\r\nConnection: keep-alive\r\n\r\nGET /2 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            8,
        )
        .unwrap();

        {
            let mut slot = conn.lock();
            let acc = slot.get_or_insert_with(|| s.pool.acquire());
            acc.fill(a);
            assert!(matches!(s.frame(acc), Framed::Ready));
        }
        s.serve(Task {
            conn: Arc::clone(&conn),
            job: Job::Serve,
        });

        let wire = String::from_utf8(read_all(b)).unwrap();
        assert_eq!(wire.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(!conn.is_closed());
        assert!(s.reactor.is_registered(a));
        // Nothing left buffered: the accumulator went back to the pool.
        assert!(conn.lock().is_none());
        assert_eq!(s.pool.in_use(), 0);

        s.sweep();
        assert!(conn.is_closed());
        socket::close(b);
    }

    #[test]
    fn test_reject_closes() {
        let s = shared(ok);
        let (a, b) = socketpair();
        let conn = Arc::new(Connection::new(a));
        s.reactor
            .register(a, EventMask::CONNECTION, Continuation::Drive(Arc::clone(&conn)))
            .unwrap();
        *conn.lock() = Some(s.pool.acquire());

        s.serve(Task {
            conn: Arc::clone(&conn),
            job: Job::Reject,
        });

        let wire = read_all(b);
        assert!(wire.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(conn.is_closed());
        assert_eq!(s.pool.in_use(), 0);
        socket::close(b);
    }

    #[test]
    fn test_frame_limits() {
        let s = shared(ok);
        let mut acc = Accumulator::new(16);
        acc.push_bytes(b"GET / HTTP/1.1\r\n");
        assert!(matches!(s.frame(&mut acc), Framed::Wait));
        acc.push_bytes(&[b'x'; 300]);
        assert!(matches!(s.frame(&mut acc), Framed::Reject));

        let mut acc = Accumulator::new(16);
        acc.push_bytes(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n");
        assert!(matches!(s.frame(&mut acc), Framed::Reject));
    }
}
