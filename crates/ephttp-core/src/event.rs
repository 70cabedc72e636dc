//! Readiness event masks.
//!
//! `EventMask` is used both as the interest set passed to `epoll_ctl` and
//! as the readiness set reported by `epoll_wait`.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const EMPTY: Self = Self(0);
    pub const READABLE: Self = Self(libc::EPOLLIN as u32);
    pub const WRITABLE: Self = Self(libc::EPOLLOUT as u32);
    pub const PEER_HUP: Self = Self(libc::EPOLLRDHUP as u32);
    pub const HUP: Self = Self(libc::EPOLLHUP as u32);
    pub const ERROR: Self = Self(libc::EPOLLERR as u32);
    pub const EDGE: Self = Self(libc::EPOLLET as u32);
    pub const ONESHOT: Self = Self(libc::EPOLLONESHOT as u32);

    /// Interest set for a listening socket.
    pub const LISTENER: Self = Self(Self::READABLE.0 | Self::EDGE.0);

    /// Interest set for a client connection: one notification per arm.
    pub const CONNECTION: Self =
        Self(Self::READABLE.0 | Self::PEER_HUP.0 | Self::EDGE.0 | Self::ONESHOT.0);

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Peer hung up or the socket is in an error state.
    #[inline]
    pub const fn is_hangup(self) -> bool {
        self.intersects(Self(Self::PEER_HUP.0 | Self::HUP.0 | Self::ERROR.0))
    }
}

impl BitOr for EventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventMask, &str); 7] = [
            (EventMask::READABLE, "IN"),
            (EventMask::WRITABLE, "OUT"),
            (EventMask::PEER_HUP, "RDHUP"),
            (EventMask::HUP, "HUP"),
            (EventMask::ERROR, "ERR"),
            (EventMask::EDGE, "ET"),
            (EventMask::ONESHOT, "ONESHOT"),
        ];
        let mut first = true;
        write!(f, "EventMask(")?;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}
