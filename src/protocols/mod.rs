//! Application callback boundary.
//!
//! The engine decodes frames; what a frame means is up to a `FrameHandler`.
//! Handlers run inline on the connection's read flow, so a slow handler slows
//! only its own connection.
//!
//! - `echo`: default handler, echoes data frames and answers time requests

pub mod echo;

pub use echo::EchoHandler;

use crate::protocol::Frame;

/// Reacts to each valid frame received on a connection.
pub trait FrameHandler: Send + Sync + 'static {
    /// Return a frame to send back to the same peer, if any.
    fn on_frame(&self, conn_id: usize, frame: &Frame) -> Option<Frame>;
}

/// Handler that never replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHandler;

impl FrameHandler for SilentHandler {
    fn on_frame(&self, _conn_id: usize, _frame: &Frame) -> Option<Frame> {
        None
    }
}
