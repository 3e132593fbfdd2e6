//! TCP server: admission control, accept loop and connection lifecycle.
//!
//! Every accepted connection costs one permit of the admission semaphore and
//! one slot from the pool. When all permits are out the accept loop simply
//! waits, so excess clients queue in the listen backlog instead of growing
//! memory. A connection's permit is released only after its slot and buffer
//! segments are back in the pools.

use crate::config::Config;
use crate::error::{PoolError, ServerError};
use crate::protocols::{EchoHandler, FrameHandler};
use crate::runtime::connection::HandleChannels;
use crate::runtime::io::{self, Dispatcher, ReadEnd};
use crate::runtime::watchdog::{self, Thresholds};
use crate::runtime::{ClientHandle, ConnStatus, ConnectionRegistry, ServerEvent, Slot, SlotPool, Traffic};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 1024;

/// State shared by the accept loop and every connection task.
struct Shared {
    config: Config,
    pool: SlotPool,
    registry: Arc<ConnectionRegistry>,
    connection_limit: Arc<Semaphore>,
    events: broadcast::Sender<ServerEvent>,
    handler: Arc<dyn FrameHandler>,
    traffic: Arc<Traffic>,
    /// First invariant violation reported by a connection task.
    fatal: watch::Sender<Option<PoolError>>,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Bind the configured address with the default echo handler.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        Self::bind_with_handler(config, Arc::new(EchoHandler)).await
    }

    /// Bind the configured address, dispatching frames to `handler`.
    pub async fn bind_with_handler(
        config: Config,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::from_std(create_listener(config.listen, config.backlog)?)?;
        let local_addr = listener.local_addr()?;

        let pool = SlotPool::new(config.max_connections, config.read_size, config.write_size);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (fatal, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            arena_bytes = pool.arena().capacity(),
            "Server bound"
        );

        Ok(Server {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                registry: Arc::new(ConnectionRegistry::new(config.max_connections)),
                connection_limit: Arc::new(Semaphore::new(config.max_connections)),
                config,
                pool,
                events,
                handler,
                traffic: Arc::new(Traffic::default()),
                fatal,
            }),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive status and message notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Number of connections currently attached to a socket.
    pub fn online_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Bytes read from all connections since the server started.
    pub fn bytes_read(&self) -> u64 {
        self.shared.traffic.bytes_read()
    }

    /// Bytes written to all connections since the server started.
    pub fn bytes_written(&self) -> u64 {
        self.shared.traffic.bytes_written()
    }

    /// Admission permits not currently held by a connection.
    pub fn available_permits(&self) -> usize {
        self.shared.connection_limit.available_permits()
    }

    /// Shared view of one online connection.
    pub fn client(&self, conn_id: usize) -> Option<Arc<ClientHandle>> {
        self.shared.registry.get(conn_id)
    }

    /// Stop accepting and close every online connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Accept connections until shut down or a fatal error is reported.
    pub async fn run(&self) -> Result<(), ServerError> {
        let config = &self.shared.config;
        info!(address = %self.local_addr, "Server listening");

        let watchdog = tokio::spawn(watchdog::run(
            Arc::clone(&self.shared.registry),
            Thresholds {
                heartbeat_after: config.heartbeat_after,
                idle_timeout: config.idle_timeout,
            },
            config.sweep_interval,
            self.shutdown.subscribe(),
        ));

        let mut shutdown = self.shutdown.subscribe();
        let mut fatal = self.shared.fatal.subscribe();

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            if self.shared.fatal.borrow().is_some() {
                break Err(self.fatal_error());
            }

            // Wait for a connection slot
            let permit = tokio::select! {
                permit = Arc::clone(&self.shared.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(ServerError::Closed),
                },
                _ = shutdown.changed() => continue,
                _ = fatal.changed() => break Err(self.fatal_error()),
            };

            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = shutdown.changed() => continue,
                _ = fatal.changed() => break Err(self.fatal_error()),
            };

            match accepted {
                Ok((stream, peer)) => self.admit(permit, stream, peer),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        };

        self.shutdown.send_replace(true);
        let online = self.shared.registry.snapshot();
        if !online.is_empty() {
            info!(connections = online.len(), "Closing online connections");
        }
        for handle in online {
            handle.begin_close();
        }

        // Every permit comes home once its connection has released its slot.
        let max = u32::try_from(config.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(config.write_timeout, self.shared.connection_limit.acquire_many(max)).await {
            Ok(Ok(_all)) => debug!("All connections drained"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                online = self.shared.registry.len(),
                "Timed out waiting for connections to drain"
            ),
        }

        if let Err(e) = watchdog.await {
            warn!(error = %e, "Watchdog task failed");
        }

        info!("Server stopped");
        result
    }

    fn fatal_error(&self) -> ServerError {
        match self.shared.fatal.borrow().clone() {
            Some(e) => ServerError::Invariant(e),
            None => ServerError::Closed,
        }
    }

    /// Attach an accepted socket to a slot and start its I/O cycle.
    fn admit(&self, permit: OwnedSemaphorePermit, stream: TcpStream, peer: SocketAddr) {
        let shared = &self.shared;

        let mut slot = match shared.pool.acquire() {
            Ok(slot) => slot,
            Err(e) => {
                // Dropping the stream refuses the peer; the permit goes back.
                warn!(peer = %peer, error = %e, "No free slot, refusing connection");
                drop(permit);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        slot.attach(peer);
        let slot_id = slot.id();
        let (handle, channels) = shared
            .registry
            .register(|conn_id| ClientHandle::new(conn_id, slot_id, peer, Instant::now()));
        let conn_id = handle.conn_id();

        debug!(conn_id, peer = %peer, slot = slot_id, "Connection opened");
        publish_status(&shared.events, &handle, ConnStatus::Opened);

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let result = drive_connection(&shared, slot, stream, Arc::clone(&handle), channels).await;
            if let Err(e) = result {
                shared.registry.remove(conn_id);
                error!(conn_id, error = %e, "Connection resources could not be released");
                shared.fatal.send_replace(Some(e));
            }
            // Released exactly once, after the slot is back in the pool.
            drop(permit);
        });
    }
}

/// Run one connection to completion and return its resources.
async fn drive_connection(
    shared: &Shared,
    mut slot: Slot,
    stream: TcpStream,
    handle: Arc<ClientHandle>,
    channels: HandleChannels,
) -> Result<(), PoolError> {
    let conn_id = handle.conn_id();
    let slot_id = slot.id();
    let HandleChannels { writes, mut cancel } = channels;

    let (mut read_seg, write_seg, decoder) = slot
        .io_parts()
        .ok_or(PoolError::MissingSegments { slot: slot_id })?;

    let (mut reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(io::write_flow(
        writer,
        write_seg,
        writes,
        cancel.clone(),
        Arc::clone(&handle),
        Arc::clone(&shared.traffic),
        shared.config.write_timeout,
    ));

    let dispatcher = Dispatcher {
        handle: Arc::clone(&handle),
        handler: Arc::clone(&shared.handler),
        events: shared.events.clone(),
        traffic: Arc::clone(&shared.traffic),
        close_on_decode_error: shared.config.close_on_decode_error,
    };
    let end = io::read_flow(&mut reader, &mut read_seg, decoder, &mut cancel, &dispatcher).await;

    handle.begin_close();
    publish_status(&shared.events, &handle, ConnStatus::Closing);
    match end {
        ReadEnd::PeerClosed | ReadEnd::Cancelled => {
            debug!(conn_id, reason = ?end, "Connection closing");
        }
        ReadEnd::Transport(_) | ReadEnd::Protocol => {
            info!(conn_id, peer = %handle.peer(), reason = ?end, "Connection closing on error");
        }
    }

    // Wait for the write flow to drain before touching its segment.
    let write_seg = writer_task.await.map_err(|e| {
        error!(conn_id, error = %e, "Write flow panicked");
        PoolError::MissingSegments { slot: slot_id }
    })?;

    slot.restore_segments(read_seg, write_seg);
    // Leave the online set only once the slot is back on the free stack.
    shared.pool.release(slot)?;
    shared.registry.remove(conn_id);

    handle.mark_closed();
    publish_status(&shared.events, &handle, ConnStatus::Closed);
    debug!(conn_id, slot = slot_id, "Connection closed");
    Ok(())
}

fn publish_status(events: &broadcast::Sender<ServerEvent>, handle: &ClientHandle, status: ConnStatus) {
    // Nobody listening is fine.
    let _ = events.send(ServerEvent::StatusChanged {
        conn_id: handle.conn_id(),
        peer: handle.peer(),
        status,
    });
}

fn create_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}
