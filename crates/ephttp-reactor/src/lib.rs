//! # ephttp-reactor: edge-triggered epoll reactor
//!
//! The reactor owns one epoll instance and a table mapping each watched
//! descriptor to a [`Continuation`]. `Reactor::run()` blocks the calling
//! thread, waits for readiness batches and hands every ready descriptor to
//! a [`Dispatch`] implementation.
//!
//! ```text
//!   epoll_wait ──► batch ──(read lock)──► [(fd, events, continuation)]
//!                                               │  (lock released)
//!                                               ▼
//!                               Dispatch::dispatch(reactor, ready)
//!                                 ├─ Accept      → socket::accept_drain
//!                                 └─ Drive(conn) → socket::read_drain ...
//! ```
//!
//! The wake descriptor ([`wake::WakeFd`]) is an eventfd registered
//! alongside the sockets; `Reactor::close()` signals it and the loop exits.
//!
//! [`socket`] holds the raw non-blocking socket calls with the transient
//! error classification shared by accept, read and write drains.

pub mod reactor;
pub mod socket;
pub mod wake;

pub use reactor::{Continuation, Dispatch, Reactor, Ready};
