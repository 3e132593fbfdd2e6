//! Echo handler.
//!
//! ```text
//! Request:  command 0x02 (server time), any payload
//! Response: command 0x02, 5E 00 E0 71 0E + "yyyy-MM-dd HH:mm:ss"
//!
//! Request:  command 0x01 (heartbeat reply from the peer)
//! Response: none, the frame only counts as activity
//!
//! Request:  any other command
//! Response: the same frame, unchanged
//! ```

use super::FrameHandler;
use crate::protocol::{Frame, CMD_HEARTBEAT, CMD_SERVER_TIME};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl FrameHandler for EchoHandler {
    fn on_frame(&self, conn_id: usize, frame: &Frame) -> Option<Frame> {
        match frame.command() {
            CMD_HEARTBEAT => None,
            CMD_SERVER_TIME => {
                trace!(conn_id, "Server time requested");
                Some(Frame::server_time_now())
            }
            _ => Some(frame.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SERVER_TIME_PREFIX;

    #[test]
    fn test_echoes_data_frames() {
        let frame = Frame::new(0x40, b"bed 7".to_vec()).unwrap();
        assert_eq!(EchoHandler.on_frame(0, &frame), Some(frame));
    }

    #[test]
    fn test_absorbs_heartbeats() {
        assert_eq!(EchoHandler.on_frame(0, &Frame::heartbeat()), None);
    }

    #[test]
    fn test_answers_time_requests() {
        let request = Frame::new(CMD_SERVER_TIME, Vec::new()).unwrap();
        let reply = EchoHandler.on_frame(0, &request).unwrap();
        assert_eq!(reply.command(), CMD_SERVER_TIME);
        assert_eq!(&reply.payload()[..5], &SERVER_TIME_PREFIX);
        assert_eq!(reply.payload().len(), 5 + "yyyy-MM-dd HH:mm:ss".len());
    }
}
