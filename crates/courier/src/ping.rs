//! Active latency monitoring.
//!
//! One side of a connection attaches a [`PingListener`] and becomes the
//! monitor: a task sends a numbered probe every interval and the peer,
//! set to echo mode, reflects it back. The receiver correlates the echo
//! against the outstanding probe and reports the round-trip time. A
//! probe whose echo misses the grace window is reported as failed, one
//! report per probe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use courier_proto::system::Ping;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connection::Connection;

/// Sequence numbers cycle below this bound.
const SEQUENCE_MODULUS: u8 = 120;

/// One latency observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingReport {
    /// The probe came back within the allowed window.
    Latency(Duration),
    /// The probe's echo never arrived in time.
    Failed,
    /// The connection closed; no further reports will follow.
    ConnectionClosed,
}

/// Receives latency observations. Swappable while monitoring runs.
pub trait PingListener: Send + Sync + 'static {
    fn ping_computed(&self, report: PingReport);
}

struct Probe {
    sequence: u8,
    sent_at: Instant,
    answered: bool,
}

pub(crate) struct PingMonitor {
    probe: Mutex<Probe>,
    listener: Mutex<Arc<dyn PingListener>>,
    stop: Notify,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PingMonitor {
    pub(crate) fn spawn(
        conn: Connection,
        listener: Arc<dyn PingListener>,
        interval: Duration,
        grace: Duration,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            probe: Mutex::new(Probe { sequence: 0, sent_at: Instant::now(), answered: true }),
            listener: Mutex::new(listener),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(monitor.clone(), conn, interval, grace));
        *monitor.task.lock() = Some(task);
        monitor
    }

    /// Replaces the report sink without restarting the probe cycle.
    pub(crate) fn swap_listener(&self, listener: Arc<dyn PingListener>) {
        *self.listener.lock() = listener;
    }

    /// Called from the receiver when a probe echo arrives. An echo
    /// whose sequence does not match the outstanding probe is stale
    /// and ignored.
    pub(crate) fn echoed(&self, sequence: u8) {
        let elapsed = {
            let mut probe = self.probe.lock();
            if probe.answered || probe.sequence != sequence {
                return;
            }
            probe.answered = true;
            probe.sent_at.elapsed()
        };
        self.listener.lock().ping_computed(PingReport::Latency(elapsed));
    }

    /// Stops the probe cycle and delivers the final
    /// [`PingReport::ConnectionClosed`] before returning.
    pub(crate) async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_one();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(monitor: Arc<PingMonitor>, conn: Connection, interval: Duration, grace: Duration) {
    let id = conn.id();
    let mut sequence: u8 = 0;

    while !monitor.stopping.load(Ordering::Acquire) {
        {
            let mut probe = monitor.probe.lock();
            probe.sequence = sequence;
            probe.sent_at = Instant::now();
            probe.answered = false;
        }
        conn.send(Ping { sequence });

        tokio::select! {
            _ = monitor.stop.notified() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !monitor.probe.lock().answered {
            // Allow a late echo one more window before declaring the
            // probe lost.
            tokio::select! {
                _ = monitor.stop.notified() => break,
                _ = tokio::time::sleep(grace) => {}
            }
            if !monitor.probe.lock().answered {
                tracing::debug!(%id, sequence, "probe went unanswered");
                monitor.listener.lock().ping_computed(PingReport::Failed);
            }
        }

        sequence = (sequence + 1) % SEQUENCE_MODULUS;
    }

    monitor.listener.lock().ping_computed(PingReport::ConnectionClosed);
    tracing::trace!(%id, "ping monitor stopped");
}
