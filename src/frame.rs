//! Ethernet frame staging buffers.
//!
//! ECM moves each Ethernet frame over the bulk pipe as a run of
//! max-packet-size packets closed by a short packet. A frame whose
//! length lands exactly on a packet boundary is closed by a zero-length
//! packet instead.

use crate::MAX_FRAME_LEN;

/// Staging capacity for one outbound frame.
pub const TX_BUFFER_LEN: usize = MAX_FRAME_LEN;

/// Reassembly capacity for one inbound frame: the maximum segment size
/// rounded up to a whole number of packets for both bulk packet sizes
/// (64 full speed, 512 high speed), so the closing short packet of a
/// full-size frame always has somewhere to land.
pub const RX_BUFFER_LEN: usize = 1536;

/// Why a frame could not be staged for transmission.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StageError {
    /// A staged frame has not finished draining.
    Busy,
    /// The frame does not fit the staging buffer.
    Oversized,
}

/// Outcome of committing one received packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RxProgress {
    /// More packets belong to this frame.
    Partial,
    /// A frame of this length is assembled and waiting to be taken.
    Complete(usize),
    /// The frame was discarded (too long, or a stray terminator).
    Dropped,
}

/// Splits one staged frame into bulk packets.
pub struct FrameWriter<'a> {
    mem: &'a mut [u8],
    len: usize,
    pos: usize,
    closed: bool,
    idle: bool,
}

impl<'a> FrameWriter<'a> {
    pub fn new(mem: &'a mut [u8]) -> Self {
        FrameWriter {
            mem,
            len: 0,
            pos: 0,
            closed: false,
            idle: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Copy `frame` in and begin a new transfer.
    pub fn stage(&mut self, frame: &[u8]) -> Result<(), StageError> {
        if !self.idle {
            return Err(StageError::Busy);
        }
        if frame.len() > self.mem.len() {
            return Err(StageError::Oversized);
        }
        self.mem[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        self.pos = 0;
        self.closed = false;
        self.idle = false;
        Ok(())
    }

    /// The next packet to place on the wire: a max-packet-size run of
    /// the frame, its closing short packet, or the zero-length packet
    /// that closes a frame landing exactly on a packet boundary.
    pub fn next_chunk(&self, max_packet: usize) -> Option<&[u8]> {
        if self.idle || self.closed {
            return None;
        }
        if self.pos < self.len {
            Some(&self.mem[self.pos..self.len.min(self.pos + max_packet)])
        } else {
            // Reachable only when the length is a packet-size multiple.
            Some(&[])
        }
    }

    /// Record that `written` bytes of the current chunk went out.
    pub fn advance(&mut self, written: usize, max_packet: usize) {
        debug_assert!(!self.idle && !self.closed);
        self.pos += written;
        if written < max_packet {
            self.closed = true;
        }
    }

    pub fn finished(&self) -> bool {
        !self.idle && self.closed
    }

    /// Retire the drained frame, returning its length.
    pub fn finish(&mut self) -> usize {
        debug_assert!(self.finished());
        self.idle = true;
        self.len
    }

    /// Drop whatever is staged.
    pub fn abort(&mut self) {
        self.idle = true;
    }
}

/// Reassembles bulk packets into one received frame.
pub struct FrameAssembler<'a> {
    mem: &'a mut [u8],
    len: usize,
    complete: bool,
    discarding: bool,
}

impl<'a> FrameAssembler<'a> {
    pub fn new(mem: &'a mut [u8]) -> Self {
        FrameAssembler {
            mem,
            len: 0,
            complete: false,
            discarding: false,
        }
    }

    /// Where the next packet lands.
    ///
    /// `None` while a completed frame waits to be taken; the endpoint
    /// stays unread and the host sees NAKs until then. A frame that
    /// outgrows the buffer flips the assembler into discard mode: the
    /// partial frame is gone, and packets are swallowed until the
    /// sender closes it.
    pub fn packet_buf(&mut self, max_packet: usize) -> Option<&mut [u8]> {
        if self.complete {
            return None;
        }
        if !self.discarding && self.len + max_packet <= self.mem.len() {
            Some(&mut self.mem[self.len..self.len + max_packet])
        } else {
            self.discarding = true;
            self.len = 0;
            Some(&mut self.mem[..max_packet])
        }
    }

    /// Account for one packet of `written` bytes read off the wire.
    pub fn commit(&mut self, written: usize, max_packet: usize) -> RxProgress {
        if self.discarding {
            if written < max_packet {
                self.discarding = false;
                return RxProgress::Dropped;
            }
            return RxProgress::Partial;
        }
        self.len += written;
        if written < max_packet {
            if self.len == 0 {
                // Stray zero-length packet between frames.
                return RxProgress::Partial;
            }
            if self.len > MAX_FRAME_LEN {
                self.len = 0;
                return RxProgress::Dropped;
            }
            self.complete = true;
            return RxProgress::Complete(self.len);
        }
        RxProgress::Partial
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Hand the assembled frame to `f`, releasing it afterwards.
    pub fn take<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if !self.complete {
            return None;
        }
        let result = f(&self.mem[..self.len]);
        self.len = 0;
        self.complete = false;
        Some(result)
    }

    /// Drop any partial or completed frame.
    pub fn reset(&mut self) {
        self.len = 0;
        self.complete = false;
        self.discarding = false;
    }
}
