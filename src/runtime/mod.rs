//! Connection engine.
//!
//! - `BufferArena`: one pre-allocated region carved into I/O segments
//! - `SlotPool`: reusable per-connection state backed by the arena
//! - `ClientHandle` / `ConnectionRegistry`: shared view of online connections
//! - `io`: per-connection read and write flows
//! - `watchdog`: idle detection and heartbeats

pub mod buffer;
pub mod connection;
pub mod io;
pub mod pool;
pub mod watchdog;

pub use buffer::{ArenaStats, BufferArena, Segment};
pub use connection::{ClientHandle, ConnStatus, ConnectionRegistry, QueueError, ServerEvent, Traffic};
pub use io::{WriteOutcome, WriteRequest};
pub use pool::{Slot, SlotPool};
pub use watchdog::{SweepReport, Thresholds};
