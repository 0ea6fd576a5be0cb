#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hive_io::{EventLoop, LoopHandle, Message, Queue, ServerConfig, TcpServer};

/// A server running on its own thread, plus everything a test needs to
/// talk to it and observe it.
pub struct ServerHarness {
    pub addr: SocketAddr,
    pub queue: Queue<Message>,
    pub handle: LoopHandle,
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHarness {
    pub fn start(worker_connections: usize, io_loops: usize) -> ServerHarness {
        let _ = env_logger::try_init();

        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let (up, down) = (Arc::clone(&connects), Arc::clone(&disconnects));
        let thread = std::thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let config = ServerConfig {
                ports: vec![0],
                worker_connections,
                io_loops,
            };
            let server = TcpServer::new(&event_loop, config).unwrap();

            server.set_connection_callback(move |_peer, connected| {
                if connected {
                    up.fetch_add(1, Ordering::SeqCst);
                } else {
                    down.fetch_add(1, Ordering::SeqCst);
                }
            });

            server.start().unwrap();

            tx.send((
                server.local_addrs()[0],
                server.message_queue(),
                event_loop.handle(),
            ))
            .unwrap();

            event_loop.run();
        });

        let (addr, queue, handle) = rx.recv().unwrap();

        ServerHarness {
            addr,
            queue,
            handle,
            connects,
            disconnects,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.addr.port())).unwrap()
    }

    pub fn wait_connects(&self, n: usize) -> bool {
        wait_until(|| self.connects.load(Ordering::SeqCst) >= n)
    }

    pub fn wait_disconnects(&self, n: usize) -> bool {
        wait_until(|| self.disconnects.load(Ordering::SeqCst) >= n)
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Polls `cond` for up to five seconds.
pub fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Builds a frame: 2-byte big-endian total length, 2-byte code, body.
pub fn frame(len: u16, code: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(body);
    out
}
