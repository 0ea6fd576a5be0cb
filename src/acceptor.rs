//! The listener side: a nonblocking listen socket whose channel drains
//! the whole accept backlog on every readable notification.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use libc::c_int;
use log::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys;

const LISTEN_BACKLOG: c_int = 511;

/// Receives each freshly accepted fd with its peer address. Ownership of
/// the fd transfers to the callback.
pub type NewConnectionCallback = Rc<dyn Fn(RawFd, SocketAddr)>;

pub struct Acceptor {
    event_loop: Rc<EventLoop>,
    listen_fd: RawFd,
    local_addr: SocketAddr,
    channel: Rc<RefCell<Channel>>,
    // held open so EMFILE can be recovered by closing it, accepting the
    // pending connection and closing that too; without this the listener
    // wedges with the connection stuck in the backlog
    idle_fd: Cell<RawFd>,
    use_accept4: Cell<bool>,
    listening: Cell<bool>,
    on_accept: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds `addr` (port 0 picks an ephemeral port). The socket starts
    /// listening only on [`listen`](Acceptor::listen).
    pub fn new(event_loop: &Rc<EventLoop>, addr: SocketAddr) -> io::Result<Rc<Acceptor>> {
        let listen_fd = sys::socket::bind(addr)?;

        let local_addr = match sys::socket::local_addr(listen_fd) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = sys::socket::close(listen_fd);
                return Err(err);
            }
        };

        let idle_fd = match sys::socket::open_idle_fd() {
            Ok(fd) => fd,
            Err(err) => {
                let _ = sys::socket::close(listen_fd);
                return Err(err);
            }
        };

        let channel = Channel::new(event_loop, listen_fd);

        let acceptor = Rc::new(Acceptor {
            event_loop: Rc::clone(event_loop),
            listen_fd,
            local_addr,
            channel,
            idle_fd: Cell::new(idle_fd),
            use_accept4: Cell::new(true),
            listening: Cell::new(false),
            on_accept: RefCell::new(None),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.borrow_mut().set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_accept();
            }
        });

        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(RawFd, SocketAddr) + 'static,
    {
        *self.on_accept.borrow_mut() = Some(Rc::new(cb));
    }

    /// Starts listening and arms read interest. Loop-thread only.
    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();

        sys::socket::listen(self.listen_fd, LISTEN_BACKLOG)?;
        self.channel.borrow_mut().enable_read()?;
        self.listening.set(true);

        info!("listening on {}", self.local_addr);
        Ok(())
    }

    // Level-triggered accept loop: keep accepting until the backlog is
    // drained so one notification serves a whole burst.
    fn handle_accept(&self) {
        loop {
            match self.accept_one() {
                Ok((fd, peer)) => {
                    let cb = self.on_accept.borrow().clone();
                    match cb {
                        Some(cb) => cb(fd, peer),
                        None => {
                            warn!("no new-connection callback installed; dropping {}", peer);
                            let _ = sys::socket::close(fd);
                        }
                    }
                }
                Err(err) => {
                    match err.kind() {
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => continue,
                        _ => {}
                    }

                    match err.raw_os_error() {
                        Some(libc::EMFILE) | Some(libc::ENFILE) => {
                            self.recover_from_fd_exhaustion();
                            break;
                        }
                        _ => {
                            error!("accept failed on {}: {}", self.local_addr, err);
                            break;
                        }
                    }
                }
            }
        }
    }

    fn accept_one(&self) -> io::Result<(RawFd, SocketAddr)> {
        if self.use_accept4.get() {
            match sys::socket::accept4(self.listen_fd) {
                // kernel predates accept4; remember and fall back
                Err(ref err) if err.raw_os_error() == Some(libc::ENOSYS) => {
                    self.use_accept4.set(false);
                }
                other => return other,
            }
        }

        sys::socket::accept(self.listen_fd)
    }

    fn recover_from_fd_exhaustion(&self) {
        warn!(
            "out of file descriptors accepting on {}; shedding one pending connection",
            self.local_addr
        );

        if self.idle_fd.get() >= 0 {
            let _ = sys::socket::close(self.idle_fd.get());
            self.idle_fd.set(-1);
        }

        // accept with the freed descriptor and close immediately so the
        // peer gets a clean close instead of a wedged half-open socket
        if let Ok((fd, _peer)) = sys::socket::accept(self.listen_fd) {
            let _ = sys::socket::close(fd);
        }

        match sys::socket::open_idle_fd() {
            Ok(fd) => self.idle_fd.set(fd),
            Err(err) => error!("failed to reopen the idle reserve fd: {}", err),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let _ = self.channel.borrow_mut().remove();
        let _ = sys::socket::close(self.listen_fd);
        if self.idle_fd.get() >= 0 {
            let _ = sys::socket::close(self.idle_fd.get());
        }
    }
}
