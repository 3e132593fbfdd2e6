//! Binary frame protocol.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +------+------+---------+--------+-------------------+----------+
//! | 0x0A | 0xED | command | length | payload (length)  | checksum |
//! +------+------+---------+--------+-------------------+----------+
//! ```
//!
//! The checksum OR-accumulates every byte from the header through the end of
//! the payload. It is order-insensitive and collides easily; it is kept as-is
//! because peers already compute it this way.
//!
//! `FrameDecoder` owns the pending byte sequence of one connection and drains
//! complete frames from it. Bytes that do not start with the header are
//! discarded two at a time until the stream realigns. A legitimate payload
//! that happens to contain the header at an even offset after a loss of
//! alignment can therefore be misread as a frame start.

use crate::error::{DecodeError, EncodeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame start signature.
pub const HEADER: [u8; 2] = [0x0A, 0xED];

/// Header + command + length + checksum, i.e. an empty-payload frame.
pub const MIN_FRAME_LEN: usize = HEADER.len() + 1 + 1 + 1;

/// Largest payload the one-byte length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Command byte of a heartbeat frame.
pub const CMD_HEARTBEAT: u8 = 0x01;

/// Command byte of a server-time frame (request and response).
pub const CMD_SERVER_TIME: u8 = 0x02;

/// Fixed payload carried by every heartbeat frame.
pub const HEARTBEAT_PAYLOAD: [u8; 5] = [0x0E, 0xA0, 0x0B, 0xEA, 0x00];

/// Prefix of a server-time payload, followed by `yyyy-MM-dd HH:mm:ss`.
pub const SERVER_TIME_PREFIX: [u8; 5] = [0x5E, 0x00, 0xE0, 0x71, 0x0E];

const LENGTH_OFFSET: usize = 3;

/// One decoded protocol message.
///
/// Every constructor bounds the payload to `MAX_PAYLOAD_LEN`, so the length
/// byte written by `encode` always matches the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: u8,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads the length byte cannot describe.
    pub fn new(command: u8, payload: impl Into<Bytes>) -> Result<Self, EncodeError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge { len: payload.len() });
        }
        Ok(Self { command, payload })
    }

    /// The fixed heartbeat frame.
    pub fn heartbeat() -> Self {
        Self {
            command: CMD_HEARTBEAT,
            payload: Bytes::from_static(&HEARTBEAT_PAYLOAD),
        }
    }

    /// A server-time frame carrying the given timestamp.
    pub fn server_time(at: chrono::NaiveDateTime) -> Self {
        let stamp = at.format("%Y-%m-%d %H:%M:%S").to_string();
        let mut payload = BytesMut::with_capacity(SERVER_TIME_PREFIX.len() + stamp.len());
        payload.put_slice(&SERVER_TIME_PREFIX);
        payload.put_slice(stamp.as_bytes());
        Self {
            command: CMD_SERVER_TIME,
            payload: payload.freeze(),
        }
    }

    /// A server-time frame carrying the current local time.
    pub fn server_time_now() -> Self {
        Self::server_time(chrono::Local::now().naive_local())
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == CMD_HEARTBEAT
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(self.encoded_len());
        dst.put_slice(&HEADER);
        dst.put_u8(self.command);
        dst.put_u8(self.length_byte());
        dst.put_slice(&self.payload);
        let sum = checksum(&dst[start..]);
        dst.put_u8(sum);
    }

    /// Write the wire form into the front of `dst`.
    ///
    /// Returns the number of bytes written, or `None` if `dst` is too short.
    pub fn encode_to_slice(&self, dst: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        let out = dst.get_mut(..len)?;
        out[..HEADER.len()].copy_from_slice(&HEADER);
        out[2] = self.command;
        out[LENGTH_OFFSET] = self.length_byte();
        out[MIN_FRAME_LEN - 1..len - 1].copy_from_slice(&self.payload);
        out[len - 1] = checksum(&out[..len - 1]);
        Some(len)
    }

    /// Wire form of this frame as a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    fn length_byte(&self) -> u8 {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_LEN);
        self.payload.len() as u8
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// OR-accumulated checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().fold(0u32, |acc, &b| acc | u32::from(b));
    (sum % 256) as u8
}

/// Stateful decoder over one connection's pending bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
    discarded: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(capacity),
            discarded: 0,
        }
    }

    /// Append freshly read bytes, preserving arrival order.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed as a frame or discarded.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Total bytes dropped while resynchronizing.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Forget everything, keeping the allocation for the next connection.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarded = 0;
    }

    /// Pull the next complete frame out of the pending bytes.
    ///
    /// Returns `None` when no complete frame is available; the partial tail
    /// stays pending. A frame whose checksum does not match is consumed and
    /// reported as an error.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        while self.pending.len() >= MIN_FRAME_LEN {
            if self.pending[..HEADER.len()] != HEADER {
                self.pending.advance(HEADER.len());
                self.discarded += HEADER.len();
                continue;
            }

            let length = self.pending[LENGTH_OFFSET] as usize;
            let frame_len = MIN_FRAME_LEN + length;
            if self.pending.len() < frame_len {
                return None;
            }

            let raw = self.pending.split_to(frame_len);
            let expected = checksum(&raw[..frame_len - 1]);
            let actual = raw[frame_len - 1];
            let command = raw[2];
            if expected != actual {
                return Some(Err(DecodeError::ChecksumMismatch {
                    command,
                    expected,
                    actual,
                }));
            }

            let payload = raw.freeze().slice(MIN_FRAME_LEN - 1..frame_len - 1);
            return Some(Ok(Frame { command, payload }));
        }
        None
    }

    /// Drain every complete frame currently available.
    pub fn drain(&mut self) -> Vec<Result<Frame, DecodeError>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}
