//! Outbound half of a connection.
//!
//! Envelopes are enqueued without blocking and a dedicated task writes
//! them to the socket according to the configured [`SendMode`]. The
//! queue has a soft limit: overflow grows the limit instead of dropping
//! or blocking, on the theory that a transport should never silently
//! lose an envelope the application handed it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_proto::{Envelope, WireWriter};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::SendMode;
use crate::connection::ConnectionId;
use crate::error::TransportError;

/// How much headroom an overflowing queue gains.
const LIMIT_GROWTH: usize = 5;

type FlushReply = oneshot::Sender<Result<(), TransportError>>;

pub(crate) struct SendQueue {
    items: VecDeque<Box<dyn Envelope>>,
    limit: usize,
}

impl SendQueue {
    fn new(limit: usize) -> Self {
        Self { items: VecDeque::new(), limit }
    }

    fn push(&mut self, envelope: Box<dyn Envelope>) {
        if self.items.len() >= self.limit {
            self.limit += LIMIT_GROWTH;
            tracing::trace!(limit = self.limit, "outbound queue limit grown");
        }
        self.items.push_back(envelope);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn limit(&self) -> usize {
        self.limit
    }

    /// Refuses a limit below the current queue length.
    fn set_limit(&mut self, limit: usize) -> bool {
        if limit < self.items.len() {
            tracing::warn!(
                requested = limit,
                queued = self.items.len(),
                "outbound queue limit left unchanged, queue already longer"
            );
            return false;
        }
        self.limit = limit;
        true
    }

    fn drain_all(&mut self) -> Vec<Box<dyn Envelope>> {
        self.items.drain(..).collect()
    }
}

struct Shared {
    queue: Mutex<SendQueue>,
    mode: SendMode,
    /// Aggregation window in timed mode, read at the start of each
    /// batch so adjustments take effect on the next one.
    window: Mutex<Duration>,
    wake: Notify,
    stop: Notify,
    stopping: AtomicBool,
}

/// Handle to the writer task. Owned by the connection.
pub(crate) struct Sender {
    shared: Arc<Shared>,
    flush_tx: mpsc::UnboundedSender<FlushReply>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    pub(crate) fn spawn(
        stream: OwnedWriteHalf,
        mode: SendMode,
        queue_limit: usize,
        fatal: Arc<Notify>,
        id: ConnectionId,
    ) -> Self {
        let window = match mode {
            SendMode::Timed { window, .. } => window,
            _ => SendMode::DEFAULT_WINDOW,
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(SendQueue::new(queue_limit)),
            mode,
            window: Mutex::new(window),
            wake: Notify::new(),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        });
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(shared.clone(), stream, flush_rx, fatal, id));
        Self { shared, flush_tx, task: Mutex::new(Some(task)) }
    }

    /// Queues an envelope. Never blocks; envelopes queued after the
    /// sender stopped are dropped.
    pub(crate) fn enqueue(&self, envelope: Box<dyn Envelope>) {
        if self.shared.stopping.load(Ordering::Acquire) {
            tracing::debug!(tag = envelope.type_id(), "envelope dropped, sender stopped");
            return;
        }
        self.shared.queue.lock().push(envelope);
        if !matches!(self.shared.mode, SendMode::UserFlush) {
            self.shared.wake.notify_one();
        }
    }

    /// Forces everything queued onto the socket and waits for the
    /// write to land, bounded by `deadline`.
    pub(crate) async fn flush(&self, deadline: Duration) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.flush_tx.send(tx).map_err(|_| TransportError::Closed)?;
        match tokio::time::timeout(deadline, rx).await {
            Err(_) => Err(TransportError::FlushTimeout),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(outcome)) => outcome,
        }
    }

    pub(crate) fn queue_limit(&self) -> usize {
        self.shared.queue.lock().limit()
    }

    pub(crate) fn set_queue_limit(&self, limit: usize) -> bool {
        self.shared.queue.lock().set_limit(limit)
    }

    /// Adjusts the timed-mode aggregation window; the next batch uses
    /// it. Ignored in the other modes.
    pub(crate) fn set_window(&self, window: Duration) {
        *self.shared.window.lock() = window;
    }

    pub(crate) fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.stop.notify_one();
    }

    /// Waits for the writer task to exit and release the socket.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut stream: OwnedWriteHalf,
    mut flush_rx: mpsc::UnboundedReceiver<FlushReply>,
    fatal: Arc<Notify>,
    id: ConnectionId,
) {
    let mut pending: Vec<FlushReply> = Vec::new();
    let eager = matches!(shared.mode, SendMode::Immediate | SendMode::Timed { .. });

    'main: loop {
        tokio::select! {
            _ = shared.stop.notified() => break 'main,
            request = flush_rx.recv() => match request {
                Some(reply) => pending.push(reply),
                None => break 'main,
            },
            _ = shared.wake.notified(), if eager => {}
        }

        // Timed mode holds the batch open for the aggregation window,
        // closing early when enough envelopes pile up. A flush request
        // skips the window entirely.
        if let SendMode::Timed { limit, .. } = shared.mode {
            if pending.is_empty() {
                let deadline = Instant::now() + *shared.window.lock();
                loop {
                    if shared.queue.lock().len() >= limit {
                        break;
                    }
                    tokio::select! {
                        _ = shared.stop.notified() => break 'main,
                        _ = sleep_until(deadline) => break,
                        request = flush_rx.recv() => {
                            if let Some(reply) = request {
                                pending.push(reply);
                            }
                            break;
                        }
                        _ = shared.wake.notified() => {}
                    }
                }
            }
        }

        let batch = shared.queue.lock().drain_all();
        let count = batch.len();
        match write_batch(&mut stream, batch).await {
            Ok(()) => {
                if count != 0 {
                    tracing::trace!(%id, count, "batch written");
                }
                for reply in pending.drain(..) {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(error) => {
                tracing::warn!(%id, %error, "write failed, shutting connection down");
                let mut first = Some(error);
                for reply in pending.drain(..) {
                    let outcome = match first.take() {
                        Some(error) => Err(error),
                        None => Err(TransportError::Closed),
                    };
                    let _ = reply.send(outcome);
                }
                fatal.notify_one();
                break 'main;
            }
        }
    }

    // FIN for the peer once the final batch is on the wire.
    let _ = stream.shutdown().await;
    tracing::trace!(%id, "sender stopped");
}

async fn write_batch(
    stream: &mut OwnedWriteHalf,
    batch: Vec<Box<dyn Envelope>>,
) -> Result<(), TransportError> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut w = WireWriter::new();
    for envelope in &batch {
        w.write_tag(envelope.type_id())?;
        envelope.encode(&mut w)?;
    }
    stream.write_all(w.as_slice()).await?;
    stream.flush().await?;
    Ok(())
}
