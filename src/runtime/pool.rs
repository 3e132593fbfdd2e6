//! Reusable per-connection slots.
//!
//! All slots are created up front. Acquiring a slot attaches a fresh
//! `(read, write)` pair from the buffer arena; releasing it checks that the
//! pair is still adjacent, returns it to the arena and puts the slot back on
//! the free stack. The slot stack and the arena are locked independently.

use crate::error::PoolError;
use crate::protocol::FrameDecoder;
use crate::runtime::buffer::{BufferArena, Segment};
use std::net::SocketAddr;
use std::sync::Mutex;

/// Per-connection state reused across connections.
#[derive(Debug)]
pub struct Slot {
    id: usize,
    read: Option<Segment>,
    write: Option<Segment>,
    peer: Option<SocketAddr>,
    decoder: FrameDecoder,
}

impl Slot {
    fn new(id: usize, pending_capacity: usize) -> Self {
        Self {
            id,
            read: None,
            write: None,
            peer: None,
            decoder: FrameDecoder::with_capacity(pending_capacity),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Associate the slot with a newly accepted peer.
    pub fn attach(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    /// Lend both segments to the I/O flows.
    pub fn take_segments(&mut self) -> Option<(Segment, Segment)> {
        match (self.read.take(), self.write.take()) {
            (Some(read), Some(write)) => Some((read, write)),
            (read, write) => {
                self.read = read;
                self.write = write;
                None
            }
        }
    }

    /// Return the segments lent by `take_segments`.
    pub fn restore_segments(&mut self, read: Segment, write: Segment) {
        self.read = Some(read);
        self.write = Some(write);
    }

    pub fn decoder(&mut self) -> &mut FrameDecoder {
        &mut self.decoder
    }

    /// Lend the segments and the pending-byte decoder together.
    pub fn io_parts(&mut self) -> Option<(Segment, Segment, &mut FrameDecoder)> {
        let (read, write) = self.take_segments()?;
        Some((read, write, &mut self.decoder))
    }
}

/// Pool of connection slots backed by one buffer arena.
pub struct SlotPool {
    free: Mutex<Vec<Slot>>,
    arena: BufferArena,
    capacity: usize,
    read_size: usize,
    write_size: usize,
}

impl SlotPool {
    /// Create `capacity` slots and an arena sized for all of them.
    pub fn new(capacity: usize, read_size: usize, write_size: usize) -> Self {
        let arena = BufferArena::for_connections(capacity, read_size, write_size);
        Self::with_arena(capacity, read_size, write_size, arena)
    }

    /// Create `capacity` slots over an explicitly sized arena.
    pub fn with_arena(capacity: usize, read_size: usize, write_size: usize, arena: BufferArena) -> Self {
        // Reverse so slot 0 is handed out first.
        let free = (0..capacity).rev().map(|id| Slot::new(id, read_size)).collect();
        Self {
            free: Mutex::new(free),
            arena,
            capacity,
            read_size,
            write_size,
        }
    }

    /// Take a free slot with freshly attached buffer segments.
    ///
    /// If the arena cannot supply segments the slot goes back unused.
    pub fn acquire(&self) -> Result<Slot, PoolError> {
        let mut slot = self.lock().pop().ok_or(PoolError::Exhausted)?;

        match self.arena.acquire(self.read_size, self.write_size) {
            Ok((read, write)) => {
                slot.restore_segments(read, write);
                Ok(slot)
            }
            Err(e) => {
                self.lock().push(slot);
                Err(e.into())
            }
        }
    }

    /// Return a slot and its segments.
    ///
    /// Non-adjacent segments mean the arena bookkeeping is corrupt; the slot
    /// is dropped rather than reused and the error must be treated as fatal.
    pub fn release(&self, mut slot: Slot) -> Result<(), PoolError> {
        let id = slot.id;
        let (read, write) = slot
            .take_segments()
            .ok_or(PoolError::MissingSegments { slot: id })?;

        let read_end = read.end();
        let write_start = write.offset();
        let region = read.join(write).map_err(|_| PoolError::SegmentsNotAdjacent {
            slot: id,
            read_end,
            write_start,
        })?;

        slot.peer = None;
        slot.decoder.clear();
        self.arena.release(region)?;
        self.lock().push(slot);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently on the free stack.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Slot>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}
