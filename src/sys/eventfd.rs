use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_void};

/// An `eventfd(2)` counter, created `EFD_CLOEXEC | EFD_NONBLOCK`.
///
/// Serves as the event loop's wakeup primitive: any thread may `write`,
/// the owning loop observes the descriptor as readable and `read`s the
/// counter back down to zero.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        EventFd::with_options(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
    }

    /// Semaphore mode: every `read` returns 1 and decrements the counter
    /// by 1, so the counter can track a queue length exactly.
    pub fn semaphore() -> io::Result<EventFd> {
        EventFd::with_options(
            0,
            libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
        )
    }

    pub fn with_options(initval: u32, flags: i32) -> io::Result<EventFd> {
        let fd = syscall!(eventfd(initval, flags))?;

        Ok(EventFd { fd })
    }

    /// Drains the counter. Fails with `WouldBlock` when it is zero.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];

        syscall!(read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()))?;

        Ok(u64::from_ne_bytes(buf))
    }

    /// Adds `val` to the counter, waking any poller watching the fd.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();

        syscall!(write(self.fd, buf.as_ptr() as *const c_void, buf.len()))?;

        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}
