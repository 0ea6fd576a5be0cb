//! The connection pool: a bounded set of preallocated session records
//! whose slots are recycled across TCP sessions. Slot reuse is what makes
//! the instance bit and the live-sequence counter necessary; see
//! [`Poller`](crate::Poller) for the event-side half of that story.

use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::frame::FrameAssembler;
use crate::sys;

/// Identity of a pool tenant: the slot index plus the one-bit instance
/// that distinguishes the current tenant from a previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: usize,
    instance: bool,
}

impl ConnectionId {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// One live TCP session: the socket, the peer, the receive state machine
/// and the channel wiring. While the record sits on the pool's free list
/// `sockfd` is −1.
pub struct Connection {
    pub(crate) slot: usize,
    pub(crate) sockfd: RawFd,
    pub(crate) instance: bool,
    pub(crate) peer: SocketAddr,
    pub(crate) write_ready: bool,
    pub(crate) assembler: FrameAssembler,
    pub(crate) live: Arc<AtomicU64>,
    pub(crate) channel: Option<Rc<RefCell<Channel>>>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        ConnectionId {
            slot: self.slot,
            instance: self.instance,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.sockfd >= 0
    }

    pub fn is_write_ready(&self) -> bool {
        self.write_ready
    }

    /// The current live sequence; envelopes capture it at frame
    /// completion and compare against it at consumption time.
    pub fn sequence(&self) -> u64 {
        self.live.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // records only drop at pool teardown; a still-open session's fd
        // must not leak past that
        if self.sockfd >= 0 {
            let _ = sys::socket::close(self.sockfd);
        }
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Bounded pool of [`Connection`] records with a free list of slot
/// indices. Loop-thread-local; cross-loop hand-off happens by posted
/// task, never by sharing the pool.
pub struct ConnectionPool {
    records: Vec<Rc<RefCell<Connection>>>,
    free: RefCell<Vec<usize>>,
}

impl ConnectionPool {
    pub fn with_capacity(capacity: usize) -> ConnectionPool {
        let records = (0..capacity)
            .map(|slot| {
                Rc::new(RefCell::new(Connection {
                    slot,
                    sockfd: -1,
                    instance: false,
                    peer: unspecified(),
                    write_ready: false,
                    assembler: FrameAssembler::new(),
                    live: Arc::new(AtomicU64::new(0)),
                    channel: None,
                }))
            })
            .collect();

        // lowest slot first
        let free = (0..capacity).rev().collect();

        ConnectionPool {
            records,
            free: RefCell::new(free),
        }
    }

    /// Pops a free record and hands it to a new tenant, flipping the
    /// instance bit so events tagged for the previous tenant are
    /// detectable as stale. `None` when the pool is exhausted.
    pub fn get(&self, fd: RawFd, peer: SocketAddr) -> Option<Rc<RefCell<Connection>>> {
        let slot = self.free.borrow_mut().pop()?;
        let conn = &self.records[slot];

        {
            let mut c = conn.borrow_mut();
            debug_assert_eq!(c.sockfd, -1);
            c.sockfd = fd;
            c.instance = !c.instance;
            c.peer = peer;
            c.write_ready = true;
            c.assembler.reset();
            c.channel = None;
        }

        Some(Rc::clone(conn))
    }

    /// Returns a record to the free list. Closes no fd (that is the
    /// caller's duty); marks the slot free and bumps the live sequence so
    /// envelopes already in flight read as stale.
    pub fn release(&self, conn: &Rc<RefCell<Connection>>) {
        let mut c = conn.borrow_mut();
        c.sockfd = -1;
        c.channel = None;
        c.live.fetch_add(1, Ordering::AcqRel);
        self.free.borrow_mut().push(c.slot);
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}
