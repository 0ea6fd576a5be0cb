//! A channel binds one file descriptor to one event loop and a set of
//! callbacks. It is a handle, not an owner: the fd is never closed here,
//! and the channel must be removed from its poller before whoever owns
//! the fd closes it.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoop;
use crate::poller::PollerKey;
use crate::sys::EventMask;
use crate::timestamp::Timestamp;

pub type ReadCallback = Rc<dyn Fn(Timestamp)>;
pub type EventCallback = Rc<dyn Fn()>;

pub struct Channel {
    weak: Weak<RefCell<Channel>>,
    owner: Weak<EventLoop>,
    fd: RawFd,
    interest: EventMask,
    revents: EventMask,
    key: Option<PollerKey>,
    tied: Option<Weak<dyn Any>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    /// Creates an unregistered channel for `fd`, owned by `event_loop`.
    /// Nothing reaches the kernel until an `enable_*` call installs a
    /// non-empty interest mask.
    pub fn new(event_loop: &Rc<EventLoop>, fd: RawFd) -> Rc<RefCell<Channel>> {
        Rc::new_cyclic(|weak| {
            RefCell::new(Channel {
                weak: weak.clone(),
                owner: Rc::downgrade(event_loop),
                fd,
                interest: EventMask::EMPTY,
                revents: EventMask::EMPTY,
                key: None,
                tied: None,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> EventMask {
        self.interest
    }

    pub fn revents(&self) -> EventMask {
        self.revents
    }

    pub(crate) fn set_revents(&mut self, revents: EventMask) {
        self.revents = revents;
    }

    // test hook: poller unit tests drive registration directly instead
    // of going through the owner loop
    #[cfg(test)]
    pub(crate) fn set_interest(&mut self, interest: EventMask) {
        self.interest = interest;
    }

    pub(crate) fn key(&self) -> Option<PollerKey> {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: Option<PollerKey>) {
        self.key = key;
    }

    pub(crate) fn take_key(&mut self) -> Option<PollerKey> {
        self.key.take()
    }

    pub(crate) fn weak(&self) -> Weak<RefCell<Channel>> {
        self.weak.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn set_read_callback<F: Fn(Timestamp) + 'static>(&mut self, cb: F) {
        self.read_cb = Some(Rc::new(cb));
    }

    pub fn set_write_callback<F: Fn() + 'static>(&mut self, cb: F) {
        self.write_cb = Some(Rc::new(cb));
    }

    pub fn set_close_callback<F: Fn() + 'static>(&mut self, cb: F) {
        self.close_cb = Some(Rc::new(cb));
    }

    pub fn set_error_callback<F: Fn() + 'static>(&mut self, cb: F) {
        self.error_cb = Some(Rc::new(cb));
    }

    /// Ties the channel to the session object that owns it. During
    /// dispatch the tie is promoted to a strong reference so a callback
    /// dropping the session cannot reclaim the channel's captures while
    /// dispatch is still on the stack.
    pub fn tie<T: Any>(&mut self, owner: &Rc<T>) {
        let owner: Rc<dyn Any> = owner.clone();
        let tied: Weak<dyn Any> = Rc::downgrade(&owner);
        self.tied = Some(tied);
    }

    pub fn enable_read(&mut self) -> io::Result<()> {
        self.interest.insert(EventMask::READ);
        self.update()
    }

    pub fn disable_read(&mut self) -> io::Result<()> {
        self.interest.remove(EventMask::READ);
        self.update()
    }

    pub fn enable_write(&mut self) -> io::Result<()> {
        self.interest.insert(EventMask::WRITE);
        self.update()
    }

    pub fn disable_write(&mut self) -> io::Result<()> {
        self.interest.remove(EventMask::WRITE);
        self.update()
    }

    pub fn disable_all(&mut self) -> io::Result<()> {
        self.interest = EventMask::EMPTY;
        self.update()
    }

    fn update(&mut self) -> io::Result<()> {
        let owner = self
            .owner
            .upgrade()
            .expect("channel updated after its event loop was dropped");
        owner.update_channel(self)
    }

    /// Unregisters from the poller and clears registration state. Must
    /// run before the fd is closed.
    pub fn remove(&mut self) -> io::Result<()> {
        match self.owner.upgrade() {
            Some(owner) => owner.remove_channel(self),
            // loop already gone means the poller (and its kernel set) is
            // gone too; nothing left to unregister from
            None => Ok(()),
        }
    }

    /// Dispatches the received mask in the fixed order
    /// close → error → read → write.
    ///
    /// Callbacks are cloned out of the borrow before any of them runs,
    /// so a callback is free to re-enter the channel (disable interest,
    /// remove it, drop the session).
    pub fn handle(channel: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
        let tied = channel.borrow().tied.clone();

        let _guard = match tied {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                // session already gone; its events die with it
                None => return,
            },
            None => None,
        };

        let (revents, read_cb, write_cb, close_cb, error_cb) = {
            let ch = channel.borrow();
            (
                ch.revents,
                ch.read_cb.clone(),
                ch.write_cb.clone(),
                ch.close_cb.clone(),
                ch.error_cb.clone(),
            )
        };

        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = close_cb {
                cb()
            }
        }

        if revents.is_error() {
            if let Some(cb) = error_cb {
                cb()
            }
        }

        if revents.is_readable() {
            if let Some(cb) = read_cb {
                cb(receive_time)
            }
        }

        if revents.is_writable() {
            if let Some(cb) = write_cb {
                cb()
            }
        }
    }
}
