//! The worker hand-off queue: a concurrent queue paired with a
//! semaphore-mode eventfd, so consumers may either poll the fd for
//! readiness or block with [`pop_wait`](Queue::pop_wait). The server
//! pushes one [`Message`](crate::Message) per completed frame; pushes
//! from one loop are consumed in order.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
pub use concurrent_queue::{PopError, PushError};

use crate::sys::EventFd;

pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    queue: ConcurrentQueue<T>,
    waker: EventFd,
}

impl<T: Send> Queue<T> {
    pub fn bounded(cap: usize) -> io::Result<Queue<T>> {
        Ok(Queue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::bounded(cap),
                waker: EventFd::semaphore()?,
            }),
        })
    }

    pub fn unbounded() -> io::Result<Queue<T>> {
        Ok(Queue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::unbounded(),
                waker: EventFd::semaphore()?,
            }),
        })
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.queue.push(value)?;
        let _ = self.inner.waker.write(1);
        Ok(())
    }

    pub fn pop(&self) -> Result<T, PopError> {
        let value = self.inner.queue.pop()?;
        // semaphore mode: take exactly one token per popped item
        let _ = self.inner.waker.read();
        Ok(value)
    }

    /// Blocking pop for consumers without a poller; returns `None` on
    /// timeout or when the queue is closed.
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.pop() {
                Ok(value) => return Some(value),
                Err(PopError::Closed) => return None,
                Err(PopError::Empty) => {}
            }

            if Instant::now() >= deadline {
                return None;
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.queue.is_full()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.queue.capacity()
    }

    pub fn close(&self) -> bool {
        self.inner.queue.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }
}

impl<T: Send> Clone for Queue<T> {
    fn clone(&self) -> Queue<T> {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

// readable exactly while items are queued
impl<T: Send> AsRawFd for Queue<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.waker.as_raw_fd()
    }
}
