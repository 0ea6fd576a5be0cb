use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, fmt};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

/// A set of epoll event bits.
///
/// The same representation serves as a channel's interest mask (built
/// from [`READ`](EventMask::READ) and [`WRITE`](EventMask::WRITE)) and
/// as the received mask a poll batch hands back; the value that goes
/// into `epoll_event.events` is the value that comes back out, with no
/// translation layer in between. Registrations are always
/// level-triggered: `EPOLLET` is never part of a mask.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const EMPTY: EventMask = EventMask(0);

    /// Readable interest. Carries `EPOLLPRI` so priority data counts as
    /// readable, and `EPOLLRDHUP` so a peer half-close surfaces as a
    /// hang-up instead of an endless readable stream.
    pub const READ: EventMask = EventMask((EPOLLIN | EPOLLPRI | EPOLLRDHUP) as u32);

    /// Writable interest.
    pub const WRITE: EventMask = EventMask(EPOLLOUT as u32);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & (EPOLLIN | EPOLLPRI) as u32 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & EPOLLOUT as u32 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & EPOLLERR as u32 != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & (EPOLLRDHUP | EPOLLHUP) as u32 != 0
    }

    pub fn insert(&mut self, other: EventMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventMask) {
        self.0 &= !other.0;
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn from_bits(bits: u32) -> EventMask {
        EventMask(bits)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut set = fmt.debug_set();
        if self.is_readable() {
            set.entry(&format_args!("readable"));
        }
        if self.is_writable() {
            set.entry(&format_args!("writable"));
        }
        if self.is_error() {
            set.entry(&format_args!("error"));
        }
        if self.is_hup() {
            set.entry(&format_args!("hup"));
        }
        set.finish()
    }
}

/// Wrapper over an `epoll(7)` instance.
///
/// Registrations carry an opaque `u64` tag that is handed back untouched
/// with every event for that descriptor. Layering meaning onto the tag
/// (the poller packs a slot index and an instance bit into it) is the
/// caller's business.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    /// Blocks until at least one registered descriptor is ready or the
    /// timeout elapses. `None` blocks indefinitely.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.events.as_mut_ptr(),
            events.events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, tag: u64, interest: EventMask) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest.bits(),
            u64: tag,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, tag: u64, interest: EventMask) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest.bits(),
            u64: tag,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl fmt::Debug for Epoll {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Epoll").field("epfd", &self.epfd).finish()
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epfd));
    }
}

/// A readiness event: the received mask plus the registration tag.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    mask: EventMask,
    tag: u64,
}

impl Event {
    pub fn readiness(&self) -> EventMask {
        self.mask
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// Reusable output buffer for [`Epoll::wait`].
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| Event {
            mask: EventMask::from_bits(event.events),
            tag: event.u64,
        })
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Events").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::EventMask;

    #[test]
    fn interest_algebra() {
        let mut mask = EventMask::EMPTY;
        assert!(mask.is_empty());

        mask.insert(EventMask::READ);
        assert!(mask.is_readable());
        assert!(!mask.is_writable());

        mask.insert(EventMask::WRITE);
        assert!(mask.is_writable());
        assert!(mask.contains(EventMask::READ));

        mask.remove(EventMask::READ);
        assert!(!mask.is_readable());
        assert!(mask.contains(EventMask::WRITE));
    }

    #[test]
    fn read_interest_registers_peer_half_close() {
        // EPOLLRDHUP rides along with readable interest, so the received
        // mask for a half-close reports hup without extra registration
        assert!(EventMask::READ.contains(EventMask::from_bits(
            libc::EPOLLRDHUP as u32
        )));
    }

    #[test]
    fn received_bits_pass_through() {
        let mask = EventMask::from_bits(
            (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32,
        );
        assert!(mask.is_readable());
        assert!(mask.is_error());
        assert!(mask.is_hup());
        assert!(!mask.is_writable());
    }
}
