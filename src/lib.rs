//! An event-driven TCP server core built on the reactor pattern: one
//! epoll-backed event loop per thread, nonblocking sockets registered
//! level-triggered, a bounded connection pool with stale-event detection
//! across slot reuse, and a length-prefixed frame decoder feeding a
//! worker hand-off queue.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use hive_io::{EventLoop, ServerConfig, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//!
//! let config = ServerConfig {
//!     ports: vec![8000],
//!     worker_connections: 512,
//!     io_loops: 0,
//! };
//!
//! let server = TcpServer::new(&event_loop, config).unwrap();
//! server.set_connection_callback(|peer, connected| {
//!     println!("{} {}", peer, if connected { "up" } else { "down" });
//! });
//!
//! // frames arrive on the message queue; hand it to as many worker
//! // threads as you like
//! let queue = server.message_queue();
//! std::thread::spawn(move || loop {
//!     if let Some(msg) = queue.pop_wait(Duration::from_secs(1)) {
//!         if msg.is_stale() {
//!             continue;
//!         }
//!         println!("{} bytes from {}", msg.frame().len(), msg.peer());
//!     }
//! });
//!
//! server.start().unwrap();
//! event_loop.run();
//! ```

mod sys;

mod acceptor;
mod channel;
mod config;
mod connection;
mod event_loop;
mod frame;
mod loop_pool;
mod poller;
mod queue;
mod server;
mod timestamp;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use channel::{Channel, EventCallback, ReadCallback};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, ConnectionPool};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use frame::{FrameAssembler, Message, Progress, FRAME_HEADER_LEN, MAX_FRAME_LEN};
pub use loop_pool::{EventLoopThread, EventLoopThreadPool};
pub use poller::Poller;
pub use queue::{PopError, PushError, Queue};
pub use server::{ConnectionCallback, TcpServer};
pub use timestamp::Timestamp;

pub use sys::{Epoll, Event, EventFd, EventMask, Events};
