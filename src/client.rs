//! Client side of the frame protocol.
//!
//! A `Client` is one connection context: the socket plus the decoder holding
//! bytes that have not formed a frame yet. Nothing is shared between clients,
//! so any number of them can run in one process.

use crate::config::DEFAULT_PORT;
use crate::error::ClientError;
use crate::protocol::{Frame, FrameDecoder};
use bytes::BytesMut;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const READ_CHUNK: usize = 1024;

/// One connection to a frame server.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl Client {
    /// Connect to `addr` and wait for the handshake to finish.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = %addr, local = ?stream.local_addr().ok(), "Connected");
        Ok(Self {
            stream,
            peer: addr,
            decoder: FrameDecoder::with_capacity(READ_CHUNK),
            buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    /// Connect to a server on the default port.
    pub async fn connect_default(ip: IpAddr) -> Result<Self, ClientError> {
        Self::connect(SocketAddr::new(ip, DEFAULT_PORT)).await
    }

    /// Like `connect`, giving up after `timeout`.
    pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        tokio::time::timeout(timeout, Self::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr,
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.stream.local_addr()?)
    }

    /// Write one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ClientError> {
        self.send_raw(&frame.to_bytes()).await
    }

    /// Write bytes as-is, framed or not.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        trace!(peer = %self.peer, bytes = bytes.len(), "Sent");
        Ok(())
    }

    /// Wait for the next complete frame.
    ///
    /// Bytes past the returned frame stay buffered for the next call. A frame
    /// with a bad checksum is consumed and reported as `ClientError::Decode`.
    pub async fn recv(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(item) = self.decoder.next_frame() {
                return Ok(item?);
            }

            self.buf.clear();
            self.buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ClientError::Closed);
            }
            self.decoder.extend(&self.buf);
        }
    }

    /// Close the sending side; the server sees end of stream.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        debug!(peer = %self.peer, "Shut down");
        Ok(())
    }
}
