//! Loop-per-thread plumbing: spawn a thread that owns an event loop,
//! hand its `LoopHandle` back, and round-robin connections over a pool
//! of such threads.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use crate::event_loop::{EventLoop, LoopHandle};

/// A thread whose whole life is one event loop: build it, run an init
/// closure on it (this is where per-loop state gets installed), then
/// `run()` until quit.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn spawn<F>(init: F) -> io::Result<EventLoopThread>
    where
        F: FnOnce(&Rc<EventLoop>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<io::Result<LoopHandle>>();

        let thread = thread::Builder::new()
            .name("hive-io-loop".into())
            .spawn(move || match EventLoop::new() {
                Ok(event_loop) => {
                    let _ = tx.send(Ok(event_loop.handle()));
                    init(&event_loop);
                    event_loop.run();
                }
                Err(err) => {
                    let _ = tx.send(Err(err));
                }
            })?;

        let handle = rx.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::Other,
                "event loop thread died during startup",
            )
        })??;

        Ok(EventLoopThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Quits the loop and joins the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// A fixed set of loop threads with round-robin hand-out.
pub struct EventLoopThreadPool {
    threads: RefCell<Vec<EventLoopThread>>,
    handles: Vec<LoopHandle>,
    next: Cell<usize>,
}

impl EventLoopThreadPool {
    pub fn spawn<F>(count: usize, init: F) -> io::Result<EventLoopThreadPool>
    where
        F: Fn(&Rc<EventLoop>) + Clone + Send + 'static,
    {
        let mut threads = Vec::with_capacity(count);
        for _ in 0..count {
            let init = init.clone();
            threads.push(EventLoopThread::spawn(move |event_loop| init(event_loop))?);
        }

        let handles = threads.iter().map(|t| t.handle()).collect();

        Ok(EventLoopThreadPool {
            threads: RefCell::new(threads),
            handles,
            next: Cell::new(0),
        })
    }

    /// The next loop in round-robin order; `None` for an empty pool.
    pub fn next_handle(&self) -> Option<LoopHandle> {
        if self.handles.is_empty() {
            return None;
        }

        let i = self.next.get();
        self.next.set(i.wrapping_add(1));
        Some(self.handles[i % self.handles.len()].clone())
    }

    /// Quits every loop and joins its thread. Idempotent.
    pub fn shutdown(&self) {
        for thread in self.threads.borrow_mut().drain(..) {
            thread.shutdown();
        }
    }
}
