//! # Reactor: the epoll wait/dispatch loop
//!
//! One `Reactor` per process. It owns:
//! 1. the epoll descriptor,
//! 2. a wake eventfd used to unblock `epoll_wait` at shutdown,
//! 3. the registration table `fd → (interest, continuation)` behind a
//!    reader/writer lock.
//!
//! `run()` captures each ready batch under the read lock and invokes the
//! dispatcher only after the lock is dropped, so continuations are free to
//! register, re-arm or unregister descriptors (including their own).
//!
//! All `epoll_ctl` calls happen while holding the table lock and after
//! checking the closed flag; releasing the epoll descriptor takes the write
//! lock. A worker thread re-arming a connection can therefore never race the
//! descriptor being closed (and its number being reused).

use ephttp_core::error::{EpError, Result};
use ephttp_core::event::EventMask;
use ephttp_core::{kdebug, kerror, kinfo};

use crate::socket::is_transient;
use crate::wake::WakeFd;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Initial `epoll_wait` batch size; doubled whenever a wait fills it.
pub const INITIAL_BATCH: usize = 1024;

/// What to do when a registered descriptor becomes ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation<T> {
    /// Listening socket: accept pending connections.
    Accept,
    /// Client connection: drive its lifecycle.
    Drive(T),
}

/// One ready descriptor, captured from a batch.
#[derive(Debug)]
pub struct Ready<T> {
    pub fd: RawFd,
    pub events: EventMask,
    pub continuation: Continuation<T>,
}

/// Receives every ready descriptor from `Reactor::run()`.
pub trait Dispatch<T> {
    fn dispatch(&mut self, reactor: &Reactor<T>, ready: Ready<T>);
}

impl<T, F> Dispatch<T> for F
where
    F: FnMut(&Reactor<T>, Ready<T>),
{
    fn dispatch(&mut self, reactor: &Reactor<T>, ready: Ready<T>) {
        self(reactor, ready)
    }
}

struct Entry<T> {
    interest: EventMask,
    continuation: Continuation<T>,
}

struct Table<T> {
    entries: HashMap<RawFd, Entry<T>>,
    closed: bool,
}

/// Result of one `epoll_wait` call.
#[derive(Debug, PartialEq, Eq)]
enum Wait {
    /// Batch captured (possibly empty on timeout); `n` events were returned.
    Batch(usize),
    /// The wake descriptor fired.
    Woken,
    /// Non-transient failure.
    Failed(i32),
}

pub struct Reactor<T> {
    epfd: RawFd,
    released: AtomicBool,
    wake: WakeFd,
    table: RwLock<Table<T>>,
    timeout: Option<Duration>,
    batch: AtomicUsize,
}

impl<T: Clone> Reactor<T> {
    /// Create the epoll instance and wake descriptor.
    ///
    /// `poll_timeout` bounds each `epoll_wait`; `None` waits indefinitely.
    pub fn create(poll_timeout: Option<Duration>) -> Result<Self> {
        Self::with_batch(poll_timeout, INITIAL_BATCH)
    }

    fn with_batch(poll_timeout: Option<Duration>, batch: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(EpError::Init(EpError::last_errno()));
        }

        let wake = match WakeFd::create() {
            Ok(w) => w,
            Err(e) => {
                unsafe { libc::close(epfd) };
                return Err(e);
            }
        };

        // Level-triggered: a pending wake keeps firing until the loop exits.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.fd() as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake.fd(), &mut ev) } != 0 {
            let errno = EpError::last_errno();
            unsafe { libc::close(epfd) };
            return Err(EpError::Init(errno));
        }

        Ok(Self {
            epfd,
            released: AtomicBool::new(false),
            wake,
            table: RwLock::new(Table {
                entries: HashMap::new(),
                closed: false,
            }),
            timeout: poll_timeout,
            batch: AtomicUsize::new(batch.max(1)),
        })
    }

    /// Start watching `fd`.
    ///
    /// Fails with `AlreadyRegistered` if `fd` has an entry, `Closed` after
    /// shutdown, or `Register(errno)` if the kernel refuses it (no entry is
    /// left behind in that case).
    pub fn register(
        &self,
        fd: RawFd,
        interest: EventMask,
        continuation: Continuation<T>,
    ) -> Result<()> {
        let mut table = self.write();
        if table.closed {
            return Err(EpError::Closed);
        }
        if fd == self.wake.fd() || table.entries.contains_key(&fd) {
            return Err(EpError::AlreadyRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
        table.entries.insert(
            fd,
            Entry {
                interest,
                continuation,
            },
        );
        Ok(())
    }

    /// Stop watching `fd`. No-op if it has no entry. Must be called before
    /// the descriptor is closed so a reused fd number cannot collide.
    pub fn unregister(&self, fd: RawFd) -> Option<Continuation<T>> {
        let mut table = self.write();
        let entry = table.entries.remove(&fd)?;
        if !self.released.load(Ordering::Acquire) {
            // ENOENT/EBADF only mean the kernel already forgot it.
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, EventMask::EMPTY);
        }
        Some(entry.continuation)
    }

    /// Re-enable a one-shot registration with its original interest set.
    ///
    /// The kernel re-evaluates readiness on `EPOLL_CTL_MOD`, so data that
    /// arrived while the descriptor was disarmed is reported right away.
    pub fn rearm(&self, fd: RawFd) -> Result<()> {
        let table = self.read();
        if table.closed {
            return Err(EpError::Closed);
        }
        let interest = table
            .entries
            .get(&fd)
            .map(|e| e.interest)
            .ok_or(EpError::NotRegistered(fd))?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.read().entries.contains_key(&fd)
    }

    pub fn registered(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Current `epoll_wait` batch capacity.
    pub fn batch_capacity(&self) -> usize {
        self.batch.load(Ordering::Relaxed)
    }

    /// Ask a running (or future) `run()` to stop, and refuse new
    /// registrations from now on. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            let mut table = self.write();
            table.closed = true;
        }
        if self.released.load(Ordering::Acquire) {
            return Ok(());
        }
        self.wake.notify()
    }

    /// Remove and return every remaining registration. Used after `run()`
    /// returns so the owner can close leftover descriptors.
    pub fn drain_registrations(&self) -> Vec<(RawFd, Continuation<T>)> {
        let mut table = self.write();
        let released = self.released.load(Ordering::Acquire);
        let drained: Vec<_> = table
            .entries
            .drain()
            .map(|(fd, e)| (fd, e.continuation))
            .collect();
        if !released {
            for (fd, _) in &drained {
                let _ = self.ctl(libc::EPOLL_CTL_DEL, *fd, EventMask::EMPTY);
            }
        }
        drained
    }

    /// Block the calling thread dispatching ready descriptors until the
    /// reactor is closed or `epoll_wait` fails with a non-transient error.
    ///
    /// The epoll descriptor is released before this returns.
    pub fn run<D: Dispatch<T>>(&self, dispatch: &mut D) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(EpError::Closed);
        }

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.batch_capacity()];
        let mut ready: Vec<Ready<T>> = Vec::with_capacity(events.len());

        kinfo!(
            "reactor: running (epfd={}, timeout={:?}, batch={})",
            self.epfd,
            self.timeout,
            events.len()
        );

        loop {
            match self.wait(&mut events, &mut ready) {
                Wait::Batch(n) => {
                    for r in ready.drain(..) {
                        dispatch.dispatch(self, r);
                    }
                    if n == events.len() {
                        let grown = events.len() * 2;
                        events.resize(grown, libc::epoll_event { events: 0, u64: 0 });
                        ready.reserve(grown);
                        self.batch.store(grown, Ordering::Relaxed);
                        kdebug!("reactor: batch full, grew to {}", grown);
                    }
                }
                Wait::Woken => {
                    ready.clear();
                    break;
                }
                Wait::Failed(errno) => {
                    ready.clear();
                    kerror!(
                        "reactor: epoll_wait failed: {}",
                        std::io::Error::from_raw_os_error(errno)
                    );
                    break;
                }
            }
        }

        self.release();
        kinfo!("reactor: stopped");
        Ok(())
    }

    /// One `epoll_wait`, with the ready continuations copied into `ready`.
    fn wait(&self, events: &mut [libc::epoll_event], ready: &mut Vec<Ready<T>>) -> Wait {
        let timeout = timeout_ms(self.timeout);
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout)
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = EpError::last_errno();
            if !is_transient(errno) {
                return Wait::Failed(errno);
            }
        };

        let table = self.read();
        for ev in &events[..n] {
            let fd = ev.u64 as RawFd;
            if fd == self.wake.fd() {
                return Wait::Woken;
            }
            // Unregistered between the wait and the lock: drop the event.
            if let Some(entry) = table.entries.get(&fd) {
                ready.push(Ready {
                    fd,
                    events: EventMask::from_bits(ev.events),
                    continuation: entry.continuation.clone(),
                });
            }
        }
        Wait::Batch(n)
    }
}

impl<T> Reactor<T> {
    /// Mark closed and release the epoll descriptor exactly once.
    fn release(&self) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.closed = true;
        if !self.released.swap(true, Ordering::AcqRel) {
            unsafe {
                libc::close(self.epfd);
            }
        }
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: EventMask) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            return Err(EpError::Register(EpError::last_errno()));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Table<T>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table<T>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for Reactor<T> {
    fn drop(&mut self) {
        self.release();
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
    }
}
