//! Per-connection read and write flows.
//!
//! Each connection runs two flows over the halves of one socket:
//!
//! - the read flow reads into the slot's read segment, appends the bytes to
//!   the pending sequence and drains complete frames before issuing the next
//!   read, so a fast sender is slowed to the pace of frame processing;
//! - the write flow takes queued frames one at a time, encodes each into the
//!   slot's write segment and writes it out under a timeout.
//!
//! Both flows check the cancellation signal before issuing new I/O. A write
//! already in flight is allowed to finish (bounded by the write timeout).

use crate::error::DecodeError;
use crate::protocol::{Frame, FrameDecoder};
use crate::protocols::FrameHandler;
use crate::runtime::buffer::Segment;
use crate::runtime::connection::{ClientHandle, ServerEvent, Traffic};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Result of one write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { bytes: usize, elapsed: Duration },
    TimedOut { elapsed: Duration },
    /// The connection was cancelled before the write was issued.
    Cancelled,
    /// The encoded frame does not fit the write segment.
    TooLarge { len: usize, capacity: usize },
    Failed(io::ErrorKind),
}

/// A frame queued for the write flow.
#[derive(Debug)]
pub struct WriteRequest {
    frame: Frame,
    reply: Option<oneshot::Sender<WriteOutcome>>,
}

impl WriteRequest {
    pub fn new(frame: Frame, reply: Option<oneshot::Sender<WriteOutcome>>) -> Self {
        Self { frame, reply }
    }

    fn complete(self, outcome: WriteOutcome) {
        if let Some(reply) = self.reply {
            // The requester may have stopped waiting.
            let _ = reply.send(outcome);
        }
    }
}

/// Why a read flow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The peer closed its side (zero-byte read).
    PeerClosed,
    /// The cancellation signal was raised.
    Cancelled,
    Transport(io::ErrorKind),
    /// A decode error under the close-on-error policy, or a reply could not be queued.
    Protocol,
}

/// What the read flow does after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close,
}

/// Routes decoded frames to events, the application handler and replies.
pub struct Dispatcher {
    pub handle: Arc<ClientHandle>,
    pub handler: Arc<dyn FrameHandler>,
    pub events: broadcast::Sender<ServerEvent>,
    pub traffic: Arc<Traffic>,
    pub close_on_decode_error: bool,
}

impl Dispatcher {
    pub async fn dispatch(&self, item: Result<Frame, DecodeError>) -> FrameAction {
        let conn_id = self.handle.conn_id();
        match item {
            Ok(frame) => {
                trace!(conn_id, command = frame.command(), len = frame.payload().len(), "Frame received");
                let reply = self.handler.on_frame(conn_id, &frame);
                // Nobody listening is fine.
                let _ = self.events.send(ServerEvent::MessageReceived {
                    conn_id,
                    peer: self.handle.peer(),
                    frame,
                });
                if let Some(reply) = reply {
                    if let Err(e) = self.handle.send(reply).await {
                        debug!(conn_id, error = ?e, "Reply not queued");
                        return FrameAction::Close;
                    }
                }
                FrameAction::Continue
            }
            Err(e) => {
                warn!(conn_id, error = %e, "Frame discarded");
                if self.close_on_decode_error {
                    FrameAction::Close
                } else {
                    FrameAction::Continue
                }
            }
        }
    }
}

/// Drive the read side until the peer leaves, an error occurs or the
/// connection is cancelled.
pub async fn read_flow<R>(
    reader: &mut R,
    segment: &mut Segment,
    decoder: &mut FrameDecoder,
    cancel: &mut watch::Receiver<bool>,
    dispatcher: &Dispatcher,
) -> ReadEnd
where
    R: AsyncRead + Unpin,
{
    let conn_id = dispatcher.handle.conn_id();
    loop {
        if *cancel.borrow() {
            return ReadEnd::Cancelled;
        }

        let n = tokio::select! {
            biased;
            res = reader.read(segment.as_mut_slice()) => match res {
                Ok(0) => return ReadEnd::PeerClosed,
                Ok(n) => n,
                Err(e) => {
                    debug!(conn_id, error = %e, "Read failed");
                    return ReadEnd::Transport(e.kind());
                }
            },
            _ = cancel.changed() => return ReadEnd::Cancelled,
        };

        trace!(conn_id, bytes = n, "Read completed");
        dispatcher.traffic.record_read(n);
        decoder.extend(&segment.as_slice()[..n]);
        dispatcher.handle.touch(Instant::now());

        while let Some(item) = decoder.next_frame() {
            if dispatcher.dispatch(item).await == FrameAction::Close {
                return ReadEnd::Protocol;
            }
        }
    }
}

/// Drive the write side until cancelled, returning the write segment.
///
/// A failed or timed-out write closes the connection.
pub async fn write_flow<W>(
    mut writer: W,
    mut segment: Segment,
    mut requests: mpsc::Receiver<WriteRequest>,
    mut cancel: watch::Receiver<bool>,
    handle: Arc<ClientHandle>,
    traffic: Arc<Traffic>,
    write_timeout: Duration,
) -> Segment
where
    W: AsyncWrite + Unpin,
{
    let conn_id = handle.conn_id();
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            req = requests.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        if *cancel.borrow() {
            request.complete(WriteOutcome::Cancelled);
            break;
        }

        let outcome = write_frame(&mut writer, &mut segment, &request.frame, write_timeout).await;
        match outcome {
            WriteOutcome::Written { bytes, elapsed } => {
                traffic.record_written(bytes);
                trace!(conn_id, bytes, elapsed_us = elapsed.as_micros() as u64, "Write completed");
            }
            WriteOutcome::TooLarge { len, capacity } => {
                warn!(conn_id, len, capacity, "Frame exceeds write segment");
            }
            WriteOutcome::TimedOut { elapsed } => {
                debug!(conn_id, elapsed_ms = elapsed.as_millis() as u64, "Write timed out");
                handle.begin_close();
            }
            WriteOutcome::Failed(kind) => {
                debug!(conn_id, error = ?kind, "Write failed");
                handle.begin_close();
            }
            WriteOutcome::Cancelled => {}
        }
        request.complete(outcome);
    }

    requests.close();
    while let Ok(request) = requests.try_recv() {
        request.complete(WriteOutcome::Cancelled);
    }

    match tokio::time::timeout(write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(conn_id, error = %e, "Shutdown failed"),
        Err(_) => trace!(conn_id, "Shutdown timed out"),
    }

    segment
}

/// Encode `frame` into `segment` and write it out.
async fn write_frame<W>(
    writer: &mut W,
    segment: &mut Segment,
    frame: &Frame,
    write_timeout: Duration,
) -> WriteOutcome
where
    W: AsyncWrite + Unpin,
{
    let capacity = segment.len();
    let Some(len) = frame.encode_to_slice(segment.as_mut_slice()) else {
        return WriteOutcome::TooLarge {
            len: frame.encoded_len(),
            capacity,
        };
    };

    let start = Instant::now();
    match tokio::time::timeout(write_timeout, writer.write_all(&segment.as_slice()[..len])).await {
        Ok(Ok(())) => WriteOutcome::Written {
            bytes: len,
            elapsed: start.elapsed(),
        },
        Ok(Err(e)) => WriteOutcome::Failed(e.kind()),
        Err(_) => WriteOutcome::TimedOut {
            elapsed: start.elapsed(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{EchoHandler, SilentHandler};
    use crate::runtime::buffer::BufferArena;
    use crate::runtime::connection::HandleChannels;
    use tokio_test::io::Builder;

    fn handle() -> (Arc<ClientHandle>, HandleChannels) {
        let (handle, channels) =
            ClientHandle::new(0, 0, "127.0.0.1:40000".parse().unwrap(), Instant::now());
        (Arc::new(handle), channels)
    }

    fn dispatcher(handle: &Arc<ClientHandle>, handler: Arc<dyn FrameHandler>) -> (Dispatcher, broadcast::Receiver<ServerEvent>) {
        let (events, rx) = broadcast::channel(64);
        let dispatcher = Dispatcher {
            handle: Arc::clone(handle),
            handler,
            events,
            traffic: Arc::new(Traffic::default()),
            close_on_decode_error: false,
        };
        (dispatcher, rx)
    }

    fn frame(command: u8, payload: &[u8]) -> Frame {
        Frame::new(command, payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_read_flow_fragmented_frame() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (mut read_seg, _write_seg) = arena.acquire(64, 64).unwrap();
        let bytes = frame(0x40, b"fragmented").to_bytes();

        let mut reader = Builder::new()
            .read(&bytes[..6])
            .read(&bytes[6..])
            .build();
        let (handle, mut channels) = handle();
        let (dispatcher, mut events) = dispatcher(&handle, Arc::new(SilentHandler));
        let mut decoder = FrameDecoder::new();

        let end = read_flow(&mut reader, &mut read_seg, &mut decoder, &mut channels.cancel, &dispatcher).await;
        assert_eq!(end, ReadEnd::PeerClosed);

        match events.try_recv().unwrap() {
            ServerEvent::MessageReceived { frame, .. } => {
                assert_eq!(frame.command(), 0x40);
                assert_eq!(&frame.payload()[..], b"fragmented");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(events.try_recv().is_err());
        assert!(decoder.pending().is_empty());
        assert_eq!(dispatcher.traffic.bytes_read(), bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_read_flow_queues_replies() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (mut read_seg, _write_seg) = arena.acquire(64, 64).unwrap();
        let mut chunk = bytes::BytesMut::new();
        frame(0x40, b"one").encode(&mut chunk);
        Frame::heartbeat().encode(&mut chunk);
        frame(0x41, b"two").encode(&mut chunk);

        let mut reader = Builder::new().read(&chunk).build();
        let (handle, mut channels) = handle();
        let (dispatcher, _events) = dispatcher(&handle, Arc::new(EchoHandler));
        let mut decoder = FrameDecoder::new();

        read_flow(&mut reader, &mut read_seg, &mut decoder, &mut channels.cancel, &dispatcher).await;

        let first = channels.writes.try_recv().unwrap();
        let second = channels.writes.try_recv().unwrap();
        assert_eq!(first.frame.command(), 0x40);
        assert_eq!(second.frame.command(), 0x41);
        assert!(channels.writes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_flow_transport_error() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (mut read_seg, _write_seg) = arena.acquire(64, 64).unwrap();
        let mut reader = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (handle, mut channels) = handle();
        let (dispatcher, _events) = dispatcher(&handle, Arc::new(SilentHandler));
        let mut decoder = FrameDecoder::new();

        let end = read_flow(&mut reader, &mut read_seg, &mut decoder, &mut channels.cancel, &dispatcher).await;
        assert_eq!(end, ReadEnd::Transport(io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_read_flow_closes_on_decode_error_when_configured() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (mut read_seg, _write_seg) = arena.acquire(64, 64).unwrap();
        let mut bad = frame(0x40, b"abc").to_bytes().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut reader = Builder::new().read(&bad).build();
        let (handle, mut channels) = handle();
        let (mut dispatcher, _events) = dispatcher(&handle, Arc::new(SilentHandler));
        dispatcher.close_on_decode_error = true;
        let mut decoder = FrameDecoder::new();

        let end = read_flow(&mut reader, &mut read_seg, &mut decoder, &mut channels.cancel, &dispatcher).await;
        assert_eq!(end, ReadEnd::Protocol);
    }

    #[tokio::test]
    async fn test_read_flow_observes_cancellation_before_reading() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (mut read_seg, _write_seg) = arena.acquire(64, 64).unwrap();
        // No reads are scripted: issuing one would be a test failure.
        let mut reader = Builder::new().build();
        let (handle, mut channels) = handle();
        let (dispatcher, _events) = dispatcher(&handle, Arc::new(SilentHandler));
        let mut decoder = FrameDecoder::new();

        handle.begin_close();
        let end = read_flow(&mut reader, &mut read_seg, &mut decoder, &mut channels.cancel, &dispatcher).await;
        assert_eq!(end, ReadEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_write_flow_writes_and_reports() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (_read_seg, write_seg) = arena.acquire(64, 64).unwrap();
        let hb = Frame::heartbeat();
        let writer = Builder::new().write(&hb.to_bytes()).build();
        let (handle, channels) = handle();
        let traffic = Arc::new(Traffic::default());

        let task = tokio::spawn(write_flow(
            writer,
            write_seg,
            channels.writes,
            channels.cancel,
            Arc::clone(&handle),
            Arc::clone(&traffic),
            Duration::from_secs(10),
        ));

        let outcome = handle.send(hb.clone()).await.unwrap().await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Written { bytes: 10, .. }));
        assert_eq!(traffic.bytes_written(), 10);

        handle.begin_close();
        let segment = task.await.unwrap();
        assert_eq!(segment.len(), 64);
    }

    #[tokio::test]
    async fn test_write_flow_rejects_oversized_frame() {
        let arena = BufferArena::for_connections(1, 64, 8);
        let (_read_seg, write_seg) = arena.acquire(64, 8).unwrap();
        let writer = Builder::new().build();
        let (handle, channels) = handle();

        let task = tokio::spawn(write_flow(
            writer,
            write_seg,
            channels.writes,
            channels.cancel,
            Arc::clone(&handle),
            Arc::new(Traffic::default()),
            Duration::from_secs(10),
        ));

        let outcome = handle.send(Frame::heartbeat()).await.unwrap().await.unwrap();
        assert_eq!(outcome, WriteOutcome::TooLarge { len: 10, capacity: 8 });
        // Oversized frames do not close the connection.
        assert!(handle.is_opened());

        handle.begin_close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_flow_failure_closes_connection() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (_read_seg, write_seg) = arena.acquire(64, 64).unwrap();
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let (handle, channels) = handle();

        let task = tokio::spawn(write_flow(
            writer,
            write_seg,
            channels.writes,
            channels.cancel,
            Arc::clone(&handle),
            Arc::new(Traffic::default()),
            Duration::from_secs(10),
        ));

        let outcome = handle.send(Frame::heartbeat()).await.unwrap().await.unwrap();
        assert_eq!(outcome, WriteOutcome::Failed(io::ErrorKind::BrokenPipe));
        task.await.unwrap();
        assert!(!handle.is_opened());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_flow_timeout_closes_connection() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (_read_seg, write_seg) = arena.acquire(64, 64).unwrap();
        // The peer stops draining for longer than the write timeout.
        let writer = Builder::new().wait(Duration::from_secs(30)).build();
        let (handle, channels) = handle();

        let task = tokio::spawn(write_flow(
            writer,
            write_seg,
            channels.writes,
            channels.cancel,
            Arc::clone(&handle),
            Arc::new(Traffic::default()),
            Duration::from_secs(10),
        ));

        let outcome = handle.send(Frame::heartbeat()).await.unwrap().await.unwrap();
        match outcome {
            WriteOutcome::TimedOut { elapsed } => assert!(elapsed >= Duration::from_secs(10)),
            other => panic!("unexpected: {:?}", other),
        }
        task.await.unwrap();
        assert!(!handle.is_opened());
    }

    #[tokio::test]
    async fn test_write_flow_cancels_queued_requests() {
        let arena = BufferArena::for_connections(1, 64, 64);
        let (_read_seg, write_seg) = arena.acquire(64, 64).unwrap();
        // No writes are scripted: issuing one would be a test failure.
        let writer = Builder::new().build();
        let (handle, channels) = handle();

        let first = handle.send(Frame::heartbeat()).await.unwrap();
        let second = handle.send(frame(0x40, b"late")).await.unwrap();
        handle.begin_close();

        let task = tokio::spawn(write_flow(
            writer,
            write_seg,
            channels.writes,
            channels.cancel,
            Arc::clone(&handle),
            Arc::new(Traffic::default()),
            Duration::from_secs(10),
        ));

        assert_eq!(first.await.unwrap(), WriteOutcome::Cancelled);
        assert_eq!(second.await.unwrap(), WriteOutcome::Cancelled);
        let segment = task.await.unwrap();
        assert_eq!(segment.len(), 64);
    }
}
