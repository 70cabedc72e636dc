//! ephttp error types.

use std::fmt;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpError {
    /// epoll, eventfd or socket creation failed.
    Init(i32),
    /// bind() failed.
    Bind(i32),
    /// listen() failed.
    Listen(i32),
    /// The listen address could not be resolved to an IPv4 socket address.
    Address(String),
    /// The descriptor already has a registration entry.
    AlreadyRegistered(RawFd),
    /// The descriptor has no registration entry.
    NotRegistered(RawFd),
    /// The reactor has been shut down.
    Closed,
    /// epoll_ctl() failed.
    Register(i32),
    /// accept4() failed with a non-transient error.
    Accept(i32),
    /// Response could not be flushed (fatal errno or retry budget spent).
    Write(i32),
    /// A worker thread could not be spawned.
    Spawn,
    /// Invalid configuration value.
    Config(&'static str),
}

impl EpError {
    /// The OS error code carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Init(e)
            | Self::Bind(e)
            | Self::Listen(e)
            | Self::Register(e)
            | Self::Accept(e)
            | Self::Write(e) => Some(*e),
            _ => None,
        }
    }

    /// Capture `errno` of the last failed libc call.
    pub fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }
}

impl fmt::Display for EpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(e) => write!(f, "init failed: {}", os_str(*e)),
            Self::Bind(e) => write!(f, "bind failed: {}", os_str(*e)),
            Self::Listen(e) => write!(f, "listen failed: {}", os_str(*e)),
            Self::Address(a) => write!(f, "invalid listen address {:?}", a),
            Self::AlreadyRegistered(fd) => write!(f, "fd {} is already registered", fd),
            Self::NotRegistered(fd) => write!(f, "fd {} is not registered", fd),
            Self::Closed => write!(f, "reactor is closed"),
            Self::Register(e) => write!(f, "epoll_ctl failed: {}", os_str(*e)),
            Self::Accept(e) => write!(f, "accept failed: {}", os_str(*e)),
            Self::Write(e) => write!(f, "write failed: {}", os_str(*e)),
            Self::Spawn => write!(f, "failed to spawn worker thread"),
            Self::Config(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for EpError {}

pub type Result<T> = std::result::Result<T, EpError>;

fn os_str(errno: i32) -> String {
    format!("{} (errno {})", std::io::Error::from_raw_os_error(errno), errno)
}
