//! The server composition: acceptors feeding connections into per-loop
//! I/O workers, each worker owning its connection pool and pushing
//! completed frames into the shared message queue.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, error, warn};

use crate::acceptor::Acceptor;
use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionPool};
use crate::event_loop::EventLoop;
use crate::frame::{Message, Progress};
use crate::loop_pool::EventLoopThreadPool;
use crate::queue::{PushError, Queue};
use crate::sys;
use crate::timestamp::Timestamp;

/// Fired with `(peer, true)` when a connection is established and
/// `(peer, false)` when it goes away. Shared across I/O loops, so it
/// must be `Send + Sync`.
pub type ConnectionCallback = Arc<dyn Fn(SocketAddr, bool) + Send + Sync>;

thread_local! {
    // the I/O worker context of this thread's event loop, if any;
    // installed by the loop thread itself so adoption tasks posted from
    // the acceptor can find the (thread-local, !Send) pool
    static CURRENT_WORKER: RefCell<Option<Rc<IoWorker>>> = RefCell::new(None);
}

enum Action {
    Wait,
    Deliver(Message),
    Close,
}

// Per-loop connection context: the pool, the live-session table and the
// channel wiring for the receive path.
pub(crate) struct IoWorker {
    event_loop: Rc<EventLoop>,
    pool: ConnectionPool,
    queue: Queue<Message>,
    conn_cb: RefCell<Option<ConnectionCallback>>,
    sessions: RefCell<IndexMap<usize, Rc<RefCell<Connection>>>>,
}

impl IoWorker {
    fn new(event_loop: &Rc<EventLoop>, capacity: usize, queue: Queue<Message>) -> Rc<IoWorker> {
        Rc::new(IoWorker {
            event_loop: Rc::clone(event_loop),
            pool: ConnectionPool::with_capacity(capacity),
            queue,
            conn_cb: RefCell::new(None),
            sessions: RefCell::new(IndexMap::new()),
        })
    }

    fn install(
        event_loop: &Rc<EventLoop>,
        capacity: usize,
        queue: Queue<Message>,
        conn_cb: Option<ConnectionCallback>,
    ) {
        let worker = IoWorker::new(event_loop, capacity, queue);
        *worker.conn_cb.borrow_mut() = conn_cb;
        CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(worker));
    }

    fn current() -> Option<Rc<IoWorker>> {
        CURRENT_WORKER.with(|current| current.borrow().clone())
    }

    fn adopt_current(fd: RawFd, peer: SocketAddr) {
        match IoWorker::current() {
            Some(worker) => IoWorker::adopt(&worker, fd, peer),
            None => {
                error!("no I/O worker installed on this thread; dropping {}", peer);
                let _ = sys::socket::close(fd);
            }
        }
    }

    /// Takes ownership of a freshly accepted fd: pool record, channel
    /// wiring, connected callback, read interest.
    fn adopt(worker: &Rc<IoWorker>, fd: RawFd, peer: SocketAddr) {
        let conn = match worker.pool.get(fd, peer) {
            Some(conn) => conn,
            None => {
                warn!(
                    "connection pool exhausted ({} slots); dropping {}",
                    worker.pool.capacity(),
                    peer
                );
                let _ = sys::socket::close(fd);
                return;
            }
        };

        let channel = Channel::new(&worker.event_loop, fd);
        {
            let mut ch = channel.borrow_mut();

            let (wk, cn) = (Rc::downgrade(worker), Rc::downgrade(&conn));
            ch.set_read_callback(move |receive_time| {
                if let (Some(worker), Some(conn)) = (wk.upgrade(), cn.upgrade()) {
                    IoWorker::handle_read(&worker, &conn, receive_time);
                }
            });

            let cn = Rc::downgrade(&conn);
            ch.set_write_callback(move || {
                if let Some(conn) = cn.upgrade() {
                    conn.borrow_mut().write_ready = true;
                }
            });

            let (wk, cn) = (Rc::downgrade(worker), Rc::downgrade(&conn));
            ch.set_close_callback(move || {
                if let (Some(worker), Some(conn)) = (wk.upgrade(), cn.upgrade()) {
                    IoWorker::close_connection(&worker, &conn);
                }
            });

            let (wk, cn) = (Rc::downgrade(worker), Rc::downgrade(&conn));
            ch.set_error_callback(move || {
                if let (Some(worker), Some(conn)) = (wk.upgrade(), cn.upgrade()) {
                    debug!("socket error on {}; closing", conn.borrow().peer_addr());
                    IoWorker::close_connection(&worker, &conn);
                }
            });

            ch.tie(&conn);
        }

        let slot = conn.borrow().id().slot();
        conn.borrow_mut().channel = Some(Rc::clone(&channel));
        worker.sessions.borrow_mut().insert(slot, Rc::clone(&conn));

        if let Some(cb) = worker.conn_cb.borrow().clone() {
            cb(peer, true);
        }

        let enable_result = channel.borrow_mut().enable_read();
        if let Err(err) = enable_result {
            error!("failed to register connection from {}: {}", peer, err);
            IoWorker::close_connection(worker, &conn);
        }
    }

    // One recv per readiness: the pool is level-triggered, so whatever
    // stays in the kernel buffer re-arms the channel immediately.
    fn handle_read(
        worker: &Rc<IoWorker>,
        conn: &Rc<RefCell<Connection>>,
        _receive_time: Timestamp,
    ) {
        let action = {
            let mut c = conn.borrow_mut();
            if c.sockfd < 0 {
                debug!("read event for a released connection slot; dropping");
                return;
            }

            let fd = c.sockfd;
            match sys::socket::recv(fd, c.assembler.window()) {
                // peer closed its half of the connection
                Ok(0) => Action::Close,
                Ok(n) => match c.assembler.advance(n) {
                    Progress::Partial => Action::Wait,
                    Progress::Rejected(len) => {
                        warn!(
                            "invalid frame length {} from {}; resynchronizing at next byte",
                            len, c.peer
                        );
                        Action::Wait
                    }
                    Progress::Complete(frame) => {
                        let msg = Message::new(c.id(), c.sequence(), c.live.clone(), c.peer, frame);
                        Action::Deliver(msg)
                    }
                },
                Err(err) => match err.kind() {
                    // transient; the next readiness retries
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Action::Wait,
                    io::ErrorKind::ConnectionReset => {
                        debug!("connection reset by {}", c.peer);
                        Action::Close
                    }
                    _ => {
                        error!("recv failed for {}: {}", c.peer, err);
                        Action::Close
                    }
                },
            }
        };

        match action {
            Action::Wait => {}
            Action::Deliver(msg) => {
                if let Err(err) = worker.queue.push(msg) {
                    let reason = match err {
                        PushError::Full(_) => "full",
                        PushError::Closed(_) => "closed",
                    };
                    warn!("worker queue is {}; dropping frame", reason);
                }
            }
            Action::Close => IoWorker::close_connection(worker, conn),
        }
    }

    /// Idempotent teardown: unregister the channel, close the fd, fire
    /// the disconnected callback, return the record to the pool.
    fn close_connection(worker: &Rc<IoWorker>, conn: &Rc<RefCell<Connection>>) {
        let (fd, peer, channel) = {
            let mut c = conn.borrow_mut();
            if c.sockfd < 0 {
                // already torn down; a second close or error event for
                // the same tenant lands here
                return;
            }
            let fd = c.sockfd;
            c.sockfd = -1;
            (fd, c.peer, c.channel.take())
        };

        // unregister before close so the kernel set never refers to a
        // closed, reusable descriptor number
        if let Some(channel) = channel {
            if let Err(err) = channel.borrow_mut().remove() {
                error!("failed to unregister connection from {}: {}", peer, err);
            }
        }

        let _ = sys::socket::close(fd);

        let slot = conn.borrow().id().slot();
        worker.sessions.borrow_mut().swap_remove(&slot);

        if let Some(cb) = worker.conn_cb.borrow().clone() {
            cb(peer, false);
        }

        worker.pool.release(conn);
        debug!("closed connection from {}", peer);
    }

    fn close_all(worker: &Rc<IoWorker>) {
        let conns: Vec<_> = worker.sessions.borrow().values().cloned().collect();
        for conn in conns {
            IoWorker::close_connection(worker, &conn);
        }
    }

    fn live_connections(&self) -> usize {
        self.sessions.borrow().len()
    }
}

/// A reactor TCP server: one or more acceptors on the loop that owns
/// this value, connections served either on the same loop or round-robin
/// over a pool of dedicated I/O loop threads, and every completed frame
/// delivered into the [message queue](TcpServer::message_queue).
pub struct TcpServer {
    event_loop: Rc<EventLoop>,
    config: ServerConfig,
    acceptors: Vec<Rc<Acceptor>>,
    worker: Rc<IoWorker>,
    io_pool: RefCell<Option<Rc<EventLoopThreadPool>>>,
    queue: Queue<Message>,
    conn_cb: RefCell<Option<ConnectionCallback>>,
    started: AtomicBool,
}

impl TcpServer {
    pub fn new(event_loop: &Rc<EventLoop>, config: ServerConfig) -> io::Result<TcpServer> {
        config.validate()?;

        let queue = Queue::unbounded()?;

        let mut acceptors = Vec::with_capacity(config.ports.len());
        for &port in &config.ports {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            acceptors.push(Acceptor::new(event_loop, addr)?);
        }

        let worker = IoWorker::new(event_loop, config.worker_connections, queue.clone());

        Ok(TcpServer {
            event_loop: Rc::clone(event_loop),
            config,
            acceptors,
            worker,
            io_pool: RefCell::new(None),
            queue,
            conn_cb: RefCell::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Not thread-safe; set before [`start`](TcpServer::start).
    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(SocketAddr, bool) + Send + Sync + 'static,
    {
        *self.conn_cb.borrow_mut() = Some(Arc::new(cb));
    }

    /// The queue completed frames are delivered into. Clone it into the
    /// worker threads that consume messages.
    pub fn message_queue(&self) -> Queue<Message> {
        self.queue.clone()
    }

    /// Actual listen addresses, useful when a port was configured as 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors.iter().map(|a| a.local_addr()).collect()
    }

    /// Sessions currently served by the acceptor loop's own worker.
    pub fn connections(&self) -> usize {
        self.worker.live_connections()
    }

    /// Transitions to listening. Idempotent; calling it again is
    /// harmless. Must run on the loop that owns this server.
    pub fn start(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();

        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let conn_cb = self.conn_cb.borrow().clone();
        *self.worker.conn_cb.borrow_mut() = conn_cb.clone();

        if self.config.io_loops > 0 {
            let capacity = self.config.worker_connections;
            let queue = self.queue.clone();
            let cb = conn_cb;
            let pool = EventLoopThreadPool::spawn(self.config.io_loops, move |event_loop| {
                IoWorker::install(event_loop, capacity, queue.clone(), cb.clone());
            })?;
            *self.io_pool.borrow_mut() = Some(Rc::new(pool));
        }

        let io_pool = self.io_pool.borrow().clone();

        for acceptor in &self.acceptors {
            let local = Rc::clone(&self.worker);
            let io_pool = io_pool.clone();

            acceptor.set_new_connection_callback(move |fd, peer| {
                match io_pool.as_ref().and_then(|pool| pool.next_handle()) {
                    // the fd and peer are Send; the pool record is picked
                    // on the target loop's own thread
                    Some(handle) => handle.run_in_loop(move || IoWorker::adopt_current(fd, peer)),
                    None => IoWorker::adopt(&local, fd, peer),
                }
            });

            acceptor.listen()?;
        }

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        IoWorker::close_all(&self.worker);
        if let Some(pool) = self.io_pool.borrow_mut().take() {
            pool.shutdown();
        }
    }
}
