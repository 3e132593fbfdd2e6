//! Connection state shared between the I/O cycle, the watchdog and the
//! accept loop.
//!
//! The heavy per-connection state (buffer segments, pending bytes) lives in a
//! `Slot` owned by the task driving the connection. Everything other tasks
//! need to observe or signal lives in a `ClientHandle` behind an `Arc`:
//! lifecycle status, last activity, the cancellation signal and the write
//! queue. Online handles are tracked in a `ConnectionRegistry`.

use crate::protocol::Frame;
use crate::runtime::io::{WriteOutcome, WriteRequest};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Pending writes allowed per connection before senders wait.
pub const WRITE_QUEUE_DEPTH: usize = 16;

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    /// Attached to a socket; reads and writes are issued.
    Opened = 0,
    /// Cancellation raised; in-flight I/O drains, nothing new is issued.
    Closing = 1,
    /// Resources returned to the pools.
    Closed = 2,
}

impl ConnStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnStatus::Opened,
            1 => ConnStatus::Closing,
            _ => ConnStatus::Closed,
        }
    }
}

/// Notifications published to whoever presents connections to a user.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    StatusChanged {
        conn_id: usize,
        peer: SocketAddr,
        status: ConnStatus,
    },
    MessageReceived {
        conn_id: usize,
        peer: SocketAddr,
        frame: Frame,
    },
}

/// Why a write request could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The connection is no longer opened.
    Closed,
    /// The write queue is full (only from `try_send`).
    Full,
}

/// Shared view of one online connection.
#[derive(Debug)]
pub struct ClientHandle {
    conn_id: usize,
    slot: usize,
    peer: SocketAddr,
    status: AtomicU8,
    last_activity: Mutex<Instant>,
    cancel: watch::Sender<bool>,
    writes: mpsc::Sender<WriteRequest>,
}

/// Receiving ends owned by the connection's I/O flows.
#[derive(Debug)]
pub struct HandleChannels {
    pub writes: mpsc::Receiver<WriteRequest>,
    pub cancel: watch::Receiver<bool>,
}

impl ClientHandle {
    /// Create an opened handle whose last activity is `now`.
    pub fn new(conn_id: usize, slot: usize, peer: SocketAddr, now: Instant) -> (Self, HandleChannels) {
        let (cancel, cancel_rx) = watch::channel(false);
        let (writes, writes_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let handle = Self {
            conn_id,
            slot,
            peer,
            status: AtomicU8::new(ConnStatus::Opened as u8),
            last_activity: Mutex::new(now),
            cancel,
            writes,
        };
        let channels = HandleChannels {
            writes: writes_rx,
            cancel: cancel_rx,
        };
        (handle, channels)
    }

    pub fn conn_id(&self) -> usize {
        self.conn_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_opened(&self) -> bool {
        self.status() == ConnStatus::Opened
    }

    /// Record traffic at `now`.
    pub fn touch(&self, now: Instant) {
        let mut last = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time since the last recorded traffic.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Move `Opened -> Closing` and raise the cancellation signal.
    ///
    /// Returns `true` only for the caller that performed the transition, so a
    /// connection is never closed twice.
    pub fn begin_close(&self) -> bool {
        let won = self
            .status
            .compare_exchange(
                ConnStatus::Opened as u8,
                ConnStatus::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.cancel.send_replace(true);
        }
        won
    }

    /// Move to `Closed` once every resource has been returned.
    pub fn mark_closed(&self) {
        self.status.store(ConnStatus::Closed as u8, Ordering::Release);
    }

    /// Queue a frame and wait for room in the queue.
    ///
    /// The returned receiver resolves once the write flow has finished with
    /// the frame.
    pub async fn send(&self, frame: Frame) -> Result<oneshot::Receiver<WriteOutcome>, QueueError> {
        if !self.is_opened() {
            return Err(QueueError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.writes
            .send(WriteRequest::new(frame, Some(tx)))
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(rx)
    }

    /// Queue a frame without waiting and without a completion report.
    pub fn try_send(&self, frame: Frame) -> Result<(), QueueError> {
        if !self.is_opened() {
            return Err(QueueError::Closed);
        }
        self.writes
            .try_send(WriteRequest::new(frame, None))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }
}

/// Byte totals across every connection since the server started.
#[derive(Debug, Default)]
pub struct Traffic {
    read: AtomicU64,
    written: AtomicU64,
}

impl Traffic {
    pub fn record_read(&self, bytes: usize) {
        self.read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: usize) {
        self.written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Registry of online connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The lock is held only
/// for the slab operation itself.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<ClientHandle>>>,
}

impl ConnectionRegistry {
    /// Create a new registry sized for `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections)),
        }
    }

    /// Insert a handle built for the next free connection id.
    pub fn register(
        &self,
        build: impl FnOnce(usize) -> (ClientHandle, HandleChannels),
    ) -> (Arc<ClientHandle>, HandleChannels) {
        let mut connections = self.lock();
        let entry = connections.vacant_entry();
        let (handle, channels) = build(entry.key());
        let handle = Arc::new(handle);
        entry.insert(Arc::clone(&handle));
        (handle, channels)
    }

    /// Remove a connection from the registry.
    pub fn remove(&self, conn_id: usize) -> Option<Arc<ClientHandle>> {
        self.lock().try_remove(conn_id)
    }

    pub fn get(&self, conn_id: usize) -> Option<Arc<ClientHandle>> {
        self.lock().get(conn_id).cloned()
    }

    /// Number of online connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current online set, taken under the lock.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.lock().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slab<Arc<ClientHandle>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}
