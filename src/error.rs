//! Error types shared across the server.
//!
//! Errors fall into four groups: resource exhaustion (reported, never fatal),
//! transport errors (local to one connection), protocol decode errors (local
//! to one frame) and invariant violations (fatal to the whole server).

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Buffer arena errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// No free offset and no untouched space left.
    #[error("buffer arena exhausted")]
    Exhausted,
    /// An offset was released while already on the free stack.
    #[error("segment at offset {offset} released twice")]
    DoubleRelease { offset: usize },
    /// A segment that does not fit the arena layout was released.
    #[error("segment at offset {offset} does not belong to this arena")]
    ForeignSegment { offset: usize },
}

impl ArenaError {
    /// Whether this error indicates corrupted bookkeeping rather than load.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(self, ArenaError::Exhausted)
    }
}

/// Connection slot pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no free connection slot")]
    Exhausted,

    #[error("slot {slot} released without its buffer segments")]
    MissingSegments { slot: usize },

    #[error("slot {slot} segments not adjacent: read ends at {read_end}, write starts at {write_start}")]
    SegmentsNotAdjacent {
        slot: usize,
        read_end: usize,
        write_start: usize,
    },

    #[error(transparent)]
    Arena(#[from] ArenaError),
}

impl PoolError {
    /// Whether this error indicates corrupted bookkeeping rather than load.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            PoolError::Exhausted => false,
            PoolError::Arena(e) => e.is_invariant_violation(),
            _ => true,
        }
    }
}

/// Frame decode errors. The offending frame has already been consumed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("checksum mismatch on command {command:#04x}: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        command: u8,
        expected: u8,
        actual: u8,
    },
}

/// Frame encode errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds the 255 byte frame limit")]
    PayloadTooLarge { len: usize },
}

/// Client connection errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {addr} did not complete within {timeout_ms} ms")]
    ConnectTimeout { addr: std::net::SocketAddr, timeout_ms: u64 },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("connection closed by server")]
    Closed,
}

/// Top-level server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Pool or arena bookkeeping is corrupt; the server must stop.
    #[error("invariant violation: {0}")]
    Invariant(PoolError),

    #[error("admission controller closed")]
    Closed,
}
