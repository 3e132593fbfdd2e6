//! Shared buffer arena.
//!
//! One contiguous region of `max_connections * (read_size + write_size)`
//! bytes is allocated up front and carved into per-connection segments.
//! Segments are handed out as owned `BytesMut` views of that single
//! allocation, so no two live segments can alias and no connection ever
//! touches the heap for its I/O buffers.
//!
//! Freed segments go onto a LIFO free stack and are reused before the
//! untouched tail of the region is split further. The arena never grows.

use crate::error::ArenaError;
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::Mutex;

/// A contiguous slice of the arena, identified by its byte offset.
#[derive(Debug)]
pub struct Segment {
    offset: usize,
    buf: BytesMut,
}

impl Segment {
    /// Offset of the first byte within the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Offset one past the last byte within the arena.
    pub fn end(&self) -> usize {
        self.offset + self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Split into `[offset, offset + at)` and `[offset + at, end)`.
    pub fn split_at(mut self, at: usize) -> (Segment, Segment) {
        let tail = self.buf.split_off(at);
        let tail_offset = self.offset + at;
        (
            self,
            Segment {
                offset: tail_offset,
                buf: tail,
            },
        )
    }

    /// Rejoin a segment split by `split_at`.
    ///
    /// Returns both halves untouched when `tail` does not start where `self` ends.
    pub fn join(mut self, tail: Segment) -> Result<Segment, (Segment, Segment)> {
        if self.end() != tail.offset {
            return Err((self, tail));
        }
        // O(1): both halves still share the original allocation.
        self.buf.unsplit(tail.buf);
        Ok(self)
    }
}

/// Snapshot of arena accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total bytes reserved at construction.
    pub capacity: usize,
    /// Bytes currently handed out.
    pub in_use: usize,
    /// Bytes sitting on the free stack.
    pub free_listed: usize,
    /// Bytes never handed out yet.
    pub untouched: usize,
}

struct ArenaState {
    /// Unassigned tail of the region.
    rest: BytesMut,
    /// Offset of `rest` within the region.
    cursor: usize,
    /// Previously released segments (LIFO for cache locality).
    free_list: Vec<Segment>,
    /// Offsets currently on `free_list`.
    free_offsets: HashSet<usize>,
    free_bytes: usize,
    in_use: usize,
}

/// Fixed-capacity arena of connection buffer segments.
pub struct BufferArena {
    state: Mutex<ArenaState>,
    capacity: usize,
}

impl BufferArena {
    /// Reserve `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ArenaState {
                rest: BytesMut::zeroed(capacity),
                cursor: 0,
                free_list: Vec::new(),
                free_offsets: HashSet::new(),
                free_bytes: 0,
                in_use: 0,
            }),
            capacity,
        }
    }

    /// Arena sized for `slots` connections of the given segment sizes.
    pub fn for_connections(slots: usize, read_size: usize, write_size: usize) -> Self {
        Self::new(slots * (read_size + write_size))
    }

    /// Hand out a contiguous `(read, write)` pair.
    ///
    /// Reuses a released region of the same size when one is available,
    /// otherwise carves a new one from the untouched tail.
    pub fn acquire(&self, read_size: usize, write_size: usize) -> Result<(Segment, Segment), ArenaError> {
        let size = read_size + write_size;
        let region = {
            let mut state = self.lock();
            let reusable = state.free_list.last().is_some_and(|seg| seg.len() == size);
            let region = if reusable {
                let seg = state.free_list.pop();
                if let Some(seg) = &seg {
                    state.free_offsets.remove(&seg.offset);
                    state.free_bytes -= seg.len();
                }
                seg
            } else if state.rest.len() >= size {
                let buf = state.rest.split_to(size);
                let offset = state.cursor;
                state.cursor += size;
                Some(Segment { offset, buf })
            } else {
                None
            };
            let region = region.ok_or(ArenaError::Exhausted)?;
            state.in_use += size;
            region
        };
        Ok(region.split_at(read_size))
    }

    /// Return a region to the free stack.
    ///
    /// The caller gives up ownership, so no I/O can still be referencing it.
    pub fn release(&self, region: Segment) -> Result<(), ArenaError> {
        let offset = region.offset;
        if region.end() > self.capacity {
            return Err(ArenaError::ForeignSegment { offset });
        }

        let mut state = self.lock();
        if offset >= state.cursor {
            return Err(ArenaError::ForeignSegment { offset });
        }
        if !state.free_offsets.insert(offset) {
            return Err(ArenaError::DoubleRelease { offset });
        }
        state.in_use -= region.len();
        state.free_bytes += region.len();
        state.free_list.push(region);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.lock();
        ArenaStats {
            capacity: self.capacity,
            in_use: state.in_use,
            free_listed: state.free_bytes,
            untouched: state.rest.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        // Critical sections never panic midway, so a poisoned lock still
        // guards consistent state.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
