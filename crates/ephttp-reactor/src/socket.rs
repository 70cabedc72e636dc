//! Non-blocking TCP socket primitives.
//!
//! Every loop in here drains to exhaustion: with edge-triggered epoll a
//! descriptor is reported once per state change, so anything left in the
//! kernel queue after a drain stops short is never reported again.
//!
//! Error classification is shared by all drains: EAGAIN/EWOULDBLOCK/EINTR
//! are transient and handled internally; every other errno is fatal to the
//! operation in progress (never to the reactor).

use ephttp_core::error::{EpError, Result};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::RawFd;

pub const DEFAULT_BACKLOG: i32 = 1024;

/// Upper bound on a single wait for `POLLOUT` inside `write_all`.
const WRITE_WAIT_MS: i32 = 10;

/// A bound, listening, non-blocking IPv4 socket. Closed on drop.
#[derive(Debug)]
pub struct Listener {
    fd: RawFd,
    addr: SocketAddrV4,
    backlog: i32,
}

impl Listener {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The address actually bound (port resolved when `:0` was requested).
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.fd >= 0 {
            close(self.fd);
            self.fd = -1;
        }
    }
}

/// Outcome of one `read_drain` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Kernel queue empty; more data may arrive later.
    Drained,
    /// Zero-length read: the peer shut down its write side.
    PeerClosed,
    /// Non-transient error; the connection should be dropped.
    Failed(i32),
}

#[inline]
pub fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

#[inline]
pub fn is_transient(errno: i32) -> bool {
    is_would_block(errno) || errno == libc::EINTR
}

/// Resolve `host:port` (or `:port` for all interfaces) to an IPv4 address.
pub fn resolve_v4(addr: &str) -> Result<SocketAddrV4> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    candidate
        .to_socket_addrs()
        .map_err(|_| EpError::Address(addr.to_string()))?
        .find_map(|a| match a {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| EpError::Address(addr.to_string()))
}

/// Create a non-blocking, address-reusable TCP socket listening on `addr`.
pub fn listen(addr: &str, backlog: i32) -> Result<Listener> {
    let sa = resolve_v4(addr)?;

    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(EpError::Init(EpError::last_errno()));
    }

    // A previous listener may still be in TIME_WAIT.
    if let Err(errno) = set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
        close(fd);
        return Err(EpError::Init(errno));
    }

    let raw = to_sockaddr_in(&sa);
    let ret = unsafe {
        libc::bind(
            fd,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let errno = EpError::last_errno();
        close(fd);
        return Err(EpError::Bind(errno));
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        let errno = EpError::last_errno();
        close(fd);
        return Err(EpError::Listen(errno));
    }

    let addr = local_addr(fd).unwrap_or(sa);
    Ok(Listener { fd, addr, backlog })
}

/// Disable Nagle and, where the platform has it, delayed ACKs. Small
/// request/response exchanges otherwise stall on the 40ms ACK timer.
pub fn set_low_latency(fd: RawFd) -> Result<()> {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1).map_err(EpError::Init)?;
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1).map_err(EpError::Init)?;
        }
    }
    Ok(())
}

/// Accept until the kernel accept queue is empty.
///
/// Each accepted descriptor is already non-blocking (`accept4` flags) when
/// handed to `on_accepted`. Returns the number of connections accepted, or
/// `Accept(errno)` when accepting cannot continue (e.g. EMFILE); the
/// connections accepted before the failure have been delivered.
pub fn accept_drain<F>(listener: RawFd, mut on_accepted: F) -> Result<usize>
where
    F: FnMut(RawFd),
{
    let mut accepted = 0;
    loop {
        let fd = unsafe {
            libc::accept4(
                listener,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            accepted += 1;
            on_accepted(fd);
            continue;
        }

        let errno = EpError::last_errno();
        if is_would_block(errno) {
            return Ok(accepted);
        }
        match errno {
            libc::EINTR => continue,
            // The pending connection died before we got to it; the next
            // one in the queue is still valid.
            libc::ECONNABORTED | libc::EPROTO | libc::EPERM => continue,
            _ => return Err(EpError::Accept(errno)),
        }
    }
}

/// Read into `scratch` until EAGAIN, EOF or a hard error, forwarding every
/// chunk to `on_chunk`.
pub fn read_drain<F>(fd: RawFd, scratch: &mut [u8], mut on_chunk: F) -> ReadOutcome
where
    F: FnMut(&[u8]),
{
    debug_assert!(!scratch.is_empty(), "read_drain needs a non-empty scratch buffer");
    loop {
        let n = unsafe {
            libc::read(
                fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
            )
        };
        if n > 0 {
            on_chunk(&scratch[..n as usize]);
            continue;
        }
        if n == 0 {
            return ReadOutcome::PeerClosed;
        }

        let errno = EpError::last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if is_would_block(errno) {
            return ReadOutcome::Drained;
        }
        return ReadOutcome::Failed(errno);
    }
}

/// Write every byte of `bytes`.
///
/// EINTR is retried freely. Each EAGAIN spends one unit of `retry_budget`
/// and waits (bounded) for the socket to become writable; once the budget
/// is gone the write fails with `Write(EAGAIN)`.
pub fn write_all(fd: RawFd, mut bytes: &[u8], retry_budget: u32) -> Result<()> {
    let mut budget = retry_budget;
    while !bytes.is_empty() {
        let n = unsafe {
            libc::send(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n >= 0 {
            bytes = &bytes[n as usize..];
            continue;
        }

        let errno = EpError::last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if is_would_block(errno) && budget > 0 {
            budget -= 1;
            wait_writable(fd, WRITE_WAIT_MS);
            continue;
        }
        return Err(EpError::Write(errno));
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout_ms: i32) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    unsafe {
        libc::poll(&mut pfd, 1, timeout_ms);
    }
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddrV4> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(EpError::Init(EpError::last_errno()));
    }
    Ok(SocketAddrV4::new(
        Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(raw.sin_port),
    ))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn set_int_opt(fd: RawFd, level: i32, name: i32, value: i32) -> std::result::Result<(), i32> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(EpError::last_errno());
    }
    Ok(())
}

fn to_sockaddr_in(sa: &SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = sa.port().to_be();
    raw.sin_addr.s_addr = u32::from_ne_bytes(sa.ip().octets());
    raw
}
