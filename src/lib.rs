//! frame-gate: a pooled TCP server for length-delimited binary frames.
//!
//! The engine accepts many concurrent clients under a fixed memory budget:
//! - An admission semaphore bounds concurrently accepted connections
//! - One pre-allocated buffer arena backs every connection's I/O segments
//! - Per-connection slots are reused instead of allocated per accept
//! - A stateful decoder tolerates fragmented reads and resynchronizes on noise
//! - A watchdog heartbeats quiet peers and closes silent ones
//!
//! `Client` is the matching connection context for the other end.
//!
//! Decoded frames and connection status changes are published as
//! `ServerEvent`s for whatever presents them to a user.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use client::Client;
pub use config::Config;
pub use error::ServerError;
pub use protocol::{Frame, FrameDecoder};
pub use protocols::FrameHandler;
pub use runtime::{ConnStatus, ServerEvent};
pub use server::Server;
