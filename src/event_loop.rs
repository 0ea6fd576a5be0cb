//! One loop per thread. The loop that a thread creates is the only loop
//! that thread drives, and everything registered with it is touched from
//! that thread alone. The only two doors in from other threads are
//! `run_in_loop` / `queue_in_loop` (plus `quit`), which go through the
//! shared task queue and the eventfd waker.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::error;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::EventMask;
use crate::sys::EventFd;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

// upper bound on one poll; the waker makes shorter sleeps unnecessary
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

// the cross-thread face of a loop
struct Shared {
    thread: ThreadId,
    quit: AtomicBool,
    handling_tasks: AtomicBool,
    tasks: Mutex<Vec<Task>>,
    waker: EventFd,
}

impl Shared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            let _ = self.waker.write(1);
        }
    }

    fn queue(&self, task: Task) {
        {
            self.tasks.lock().unwrap().push(task);
        }

        // a task queued from the loop thread outside the drain phase is
        // picked up by the current iteration anyway; everything else
        // needs the poll unblocked
        if !self.is_in_loop_thread() || self.handling_tasks.load(Ordering::Acquire) {
            let _ = self.waker.write(1);
        }
    }
}

/// A single-threaded cooperative executor multiplexing I/O readiness and
/// posted tasks.
///
/// Construction binds the loop to the calling thread for its lifetime.
/// All methods except [`run_in_loop`](EventLoop::run_in_loop),
/// [`queue_in_loop`](EventLoop::queue_in_loop) and
/// [`quit`](EventLoop::quit) assert loop-thread affinity. Foreign
/// threads hold a [`LoopHandle`] instead of the loop itself.
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    scratch: RefCell<Vec<(EventMask, u64)>>,
    wakeup_channel: RefCell<Option<Rc<RefCell<Channel>>>>,
    looping: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<EventLoop>> {
        let poller = Poller::new()?;
        let waker = EventFd::new()?;
        let waker_fd = waker.as_raw_fd();

        let shared = Arc::new(Shared {
            thread: thread::current().id(),
            quit: AtomicBool::new(false),
            handling_tasks: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            waker,
        });

        let event_loop = Rc::new(EventLoop {
            shared,
            poller: RefCell::new(poller),
            scratch: RefCell::new(Vec::new()),
            wakeup_channel: RefCell::new(None),
            looping: Cell::new(false),
        });

        let channel = Channel::new(&event_loop, waker_fd);
        {
            let weak = Rc::downgrade(&event_loop);
            let mut ch = channel.borrow_mut();
            ch.set_read_callback(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.drain_waker();
                }
            });
            ch.enable_read()?;
        }
        *event_loop.wakeup_channel.borrow_mut() = Some(channel);

        Ok(event_loop)
    }

    /// A `Send + Sync` handle for submitting work and quitting from
    /// other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop accessed from a foreign thread"
        );
    }

    pub fn is_running(&self) -> bool {
        self.looping.get()
    }

    /// Runs until [`quit`](EventLoop::quit). Each iteration polls,
    /// dispatches every event of the batch, then drains the task queue;
    /// tasks queued during dispatch therefore never run before the
    /// events that preceded them.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "event loop is already running");

        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut ready = self.scratch.take();
            ready.clear();

            let receive_time = match self.poller.borrow_mut().poll(Some(POLL_TIMEOUT), &mut ready)
            {
                Ok(t) => t,
                Err(err) => {
                    error!("poll failed, stopping loop: {}", err);
                    break;
                }
            };

            // resolve each event against the registry at dispatch time,
            // not poll time: a slot freed by an earlier callback in this
            // very batch must invalidate the later events tagged for it
            for &(readiness, tag) in ready.iter() {
                let channel = self.poller.borrow_mut().resolve(tag, readiness);
                if let Some(channel) = channel {
                    Channel::handle(&channel, receive_time);
                }
            }

            self.scratch.replace(ready);
            self.handle_pending_tasks();
        }

        self.looping.set(false);
    }

    /// Thread-safe; the loop notices on its next iteration. In-flight
    /// callbacks complete.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Runs `task` immediately when called on the loop thread, otherwise
    /// queues it and wakes the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.shared.queue(Box::new(task));
        }
    }

    /// Always queues, even on the loop thread; the task runs in the
    /// drain phase of a later iteration.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue(Box::new(task));
    }

    pub(crate) fn update_channel(&self, channel: &mut Channel) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update(channel)
    }

    pub(crate) fn remove_channel(&self, channel: &mut Channel) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove(channel)
    }

    fn drain_waker(&self) {
        if let Err(err) = self.shared.waker.read() {
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("failed to drain wakeup eventfd: {}", err);
            }
        }
    }

    // swap-under-lock: enqueues landing during execution wait for the
    // next iteration, and the lock is never held across a task
    fn handle_pending_tasks(&self) {
        self.shared.handling_tasks.store(true, Ordering::Release);

        let tasks: Vec<Task> = {
            let mut queue = self.shared.tasks.lock().unwrap();
            std::mem::take(&mut *queue)
        };

        for task in tasks {
            task();
        }

        self.shared.handling_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // unregister the wakeup channel before the waker fd goes away
        // with the shared state
        if let Some(channel) = self.wakeup_channel.borrow_mut().take() {
            let _ = self.poller.borrow_mut().remove(&mut channel.borrow_mut());
        }
    }
}

/// Cross-thread handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop accessed from a foreign thread"
        );
    }

    /// Runs `task` immediately when called on the loop thread, otherwise
    /// queues it and wakes the loop.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.shared.queue(Box::new(task));
        }
    }

    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue(Box::new(task));
    }

    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Forces a blocked poll to return promptly.
    pub fn wakeup(&self) -> io::Result<()> {
        self.shared.waker.write(1)
    }
}
