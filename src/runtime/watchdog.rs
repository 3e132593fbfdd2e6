//! Liveness watchdog.
//!
//! Every sweep interval the watchdog looks at a snapshot of the online set:
//! connections silent past the hard threshold are closed, connections silent
//! past the soft threshold get a heartbeat. Heartbeats are queued without
//! waiting, so one stuck peer cannot stall the sweep.
//!
//! Closing only raises the connection's cancellation signal. The task that
//! owns the connection observes it, drains in-flight I/O and returns the slot.

use crate::protocol::Frame;
use crate::runtime::connection::{ConnectionRegistry, QueueError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Idle thresholds applied on each sweep.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Soft threshold: send a heartbeat.
    pub heartbeat_after: Duration,
    /// Hard threshold: close the connection.
    pub idle_timeout: Duration,
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: usize,
    pub heartbeats: usize,
    /// Heartbeats skipped because the write queue was full.
    pub skipped: usize,
}

/// Run one sweep over the online set as of `now`.
pub fn sweep(registry: &ConnectionRegistry, thresholds: Thresholds, now: Instant) -> SweepReport {
    let mut report = SweepReport::default();

    for handle in registry.snapshot() {
        if !handle.is_opened() {
            continue;
        }
        let idle = handle.idle_for(now);

        if idle >= thresholds.idle_timeout {
            // Only the caller that wins the transition counts the close.
            if handle.begin_close() {
                debug!(
                    conn_id = handle.conn_id(),
                    peer = %handle.peer(),
                    idle_ms = idle.as_millis() as u64,
                    "Closing idle connection"
                );
                report.closed += 1;
            }
        } else if idle >= thresholds.heartbeat_after {
            match handle.try_send(Frame::heartbeat()) {
                Ok(()) => {
                    trace!(conn_id = handle.conn_id(), "Heartbeat queued");
                    report.heartbeats += 1;
                }
                Err(QueueError::Full) => report.skipped += 1,
                // Closed concurrently; nothing to do.
                Err(QueueError::Closed) => {}
            }
        }
    }

    report
}

/// Sweep on a fixed interval until `shutdown` flips to `true`.
pub async fn run(
    registry: Arc<ConnectionRegistry>,
    thresholds: Thresholds,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        heartbeat_after_ms = thresholds.heartbeat_after.as_millis() as u64,
        idle_timeout_ms = thresholds.idle_timeout.as_millis() as u64,
        "Liveness watchdog started"
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            res = shutdown.changed() => {
                if res.is_err() {
                    break;
                }
                continue;
            }
        }

        let report = sweep(&registry, thresholds, Instant::now());
        if report.closed > 0 || report.skipped > 0 {
            debug!(
                closed = report.closed,
                heartbeats = report.heartbeats,
                skipped = report.skipped,
                "Watchdog sweep"
            );
        }
    }

    debug!("Liveness watchdog stopped");
}
