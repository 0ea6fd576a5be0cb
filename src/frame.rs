//! Wire framing: a fixed 4-byte header whose first two bytes are a
//! big-endian `u16` total length (header + body), followed by an opaque
//! 2-byte message code. Complete frames are wrapped in a [`Message`]
//! envelope and handed to the worker queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionId;

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on the declared total length; anything larger is treated
/// as garbage and rejected.
pub const MAX_FRAME_LEN: usize = 10240;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
}

/// Outcome of feeding bytes into a [`FrameAssembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed before anything can be decided.
    Partial,
    /// A full frame (header + body) was assembled.
    Complete(Vec<u8>),
    /// The header declared an invalid total length; the assembler is
    /// back in header phase, resynchronizing at the next byte.
    Rejected(u16),
}

/// The per-connection receive state machine.
///
/// Exactly two phases: reading the fixed header, then reading the
/// declared body. [`window`](FrameAssembler::window) exposes the bytes
/// still missing in the current phase as a mutable slice (cursor plus
/// remaining, in effect); the caller `recv`s directly into it and
/// reports how much landed via [`advance`](FrameAssembler::advance).
/// Phase transitions happen only when the window has been filled
/// completely, so one `advance` can complete at most one frame.
#[derive(Debug)]
pub struct FrameAssembler {
    phase: Phase,
    header: [u8; FRAME_HEADER_LEN],
    pos: usize,
    frame: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            phase: Phase::Header,
            header: [0; FRAME_HEADER_LEN],
            pos: 0,
            frame: Vec::new(),
        }
    }

    /// Discards any partial state and returns to header phase. Used
    /// when a pool record is handed to a new connection.
    pub fn reset(&mut self) {
        self.phase = Phase::Header;
        self.pos = 0;
        self.frame = Vec::new();
    }

    /// The bytes the current phase still needs. Never empty.
    pub fn window(&mut self) -> &mut [u8] {
        match self.phase {
            Phase::Header => &mut self.header[self.pos..],
            Phase::Body => &mut self.frame[self.pos..],
        }
    }

    /// Records that `n` bytes were received into the window.
    pub fn advance(&mut self, n: usize) -> Progress {
        self.pos += n;

        match self.phase {
            Phase::Header => {
                debug_assert!(self.pos <= FRAME_HEADER_LEN);
                if self.pos == FRAME_HEADER_LEN {
                    self.parse_header()
                } else {
                    Progress::Partial
                }
            }
            Phase::Body => {
                debug_assert!(self.pos <= self.frame.len());
                if self.pos == self.frame.len() {
                    self.phase = Phase::Header;
                    self.pos = 0;
                    Progress::Complete(std::mem::take(&mut self.frame))
                } else {
                    Progress::Partial
                }
            }
        }
    }

    fn parse_header(&mut self) -> Progress {
        let total = u16::from_be_bytes([self.header[0], self.header[1]]);

        if (total as usize) < FRAME_HEADER_LEN || total as usize > MAX_FRAME_LEN {
            // Invalid declared length. Any body bytes the peer sends for
            // this frame are NOT drained; the next header parse starts at
            // the next byte on the wire. The framing offers no resync
            // marker, so a connection that misaligns here stays garbled
            // until it sends something that parses or gets closed.
            self.phase = Phase::Header;
            self.pos = 0;
            return Progress::Rejected(total);
        }

        let mut frame = vec![0u8; total as usize];
        frame[..FRAME_HEADER_LEN].copy_from_slice(&self.header);

        if total as usize == FRAME_HEADER_LEN {
            self.pos = 0;
            return Progress::Complete(frame);
        }

        self.frame = frame;
        self.phase = Phase::Body;
        self.pos = FRAME_HEADER_LEN;
        Progress::Partial
    }
}

impl Default for FrameAssembler {
    fn default() -> FrameAssembler {
        FrameAssembler::new()
    }
}

/// Delivery envelope: one complete frame plus enough context for a
/// worker to tell whether the originating connection is still the same
/// tenant it was when the frame arrived.
#[derive(Debug)]
pub struct Message {
    conn: ConnectionId,
    sequence: u64,
    live: Arc<AtomicU64>,
    peer: SocketAddr,
    frame: Vec<u8>,
}

impl Message {
    pub(crate) fn new(
        conn: ConnectionId,
        sequence: u64,
        live: Arc<AtomicU64>,
        peer: SocketAddr,
        frame: Vec<u8>,
    ) -> Message {
        Message {
            conn,
            sequence,
            live,
            peer,
            frame,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True once the originating connection has been closed (or its pool
    /// slot reused) since this frame arrived. Workers check this before
    /// acting on the frame.
    pub fn is_stale(&self) -> bool {
        self.live.load(Ordering::Acquire) != self.sequence
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The raw frame, header included.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// The body, i.e. the frame minus the fixed header.
    pub fn body(&self) -> &[u8] {
        &self.frame[FRAME_HEADER_LEN..]
    }

    /// The opaque message code from header bytes 2..4.
    pub fn code(&self) -> u16 {
        u16::from_be_bytes([self.frame[2], self.frame[3]])
    }

    pub fn into_frame(self) -> Vec<u8> {
        self.frame
    }
}
