//! `WakeFd`: eventfd used to interrupt a blocked `epoll_wait`.
//!
//! Coalescing: several `notify()` calls before the reactor observes the
//! descriptor produce a single readiness event (eventfd counter semantics).

use ephttp_core::error::{EpError, Result};

use std::os::unix::io::RawFd;

pub struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    /// Create a non-blocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(EpError::Init(EpError::last_errno()));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter. Never blocks.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = EpError::last_errno();
            // Counter saturated: a wakeup is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(EpError::Init(errno));
        }
        Ok(())
    }

    /// Reset the counter to zero; returns the value that was pending.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let wake = WakeFd::create().unwrap();
        assert_eq!(wake.drain(), 0);
        wake.notify().unwrap();
        wake.notify().unwrap();
        wake.notify().unwrap();
        assert_eq!(wake.drain(), 3);
        assert_eq!(wake.drain(), 0);
    }
}
