//! A live point-to-point connection.
//!
//! [`Connection`] is a cheap clonable handle over shared state. The
//! outbound half runs as a writer task from the moment the connection
//! opens, so an endpoint can queue and flush envelopes before inbound
//! dispatch starts; inbound dispatch begins at [`Connection::start`]
//! (async mode) or whenever the application drains (sync mode).
//!
//! Closing is funneled through one path. Either side's receiver or a
//! failed write signals a fatal condition, and a small watchdog task
//! turns that signal into the same orderly [`Connection::close`] the
//! application would call.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use courier_proto::{Envelope, Registry, SessionContext, system::EndOfConnection};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::config::{ConnectionConfig, RecvMode};
use crate::error::TransportError;
use crate::ping::{PingListener, PingMonitor};
use crate::receiver::{self, Receiver};
use crate::sender::Sender;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, used in logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Observes connection lifecycle transitions.
pub trait ConnectionListener: Send + Sync + 'static {
    /// Fired when the listener is registered on a live connection.
    fn on_created(&self, _conn: &Connection) {}

    /// Fired exactly once, when the connection finishes closing.
    fn on_closed(&self, conn: &Connection);
}

struct ConnInner {
    id: ConnectionId,
    peer: SocketAddr,
    config: ConnectionConfig,
    registry: Arc<Registry>,
    sender: Sender,
    receiver: Receiver,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    ping: Mutex<Option<Arc<PingMonitor>>>,
    state: AtomicU8,
    fatal: Arc<Notify>,
    shutdown: Notify,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Wraps an established socket. The writer task starts right away;
    /// inbound dispatch waits for [`start`](Connection::start) or the
    /// first drain.
    pub fn open(
        stream: TcpStream,
        config: ConnectionConfig,
        registry: Arc<Registry>,
    ) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let id = ConnectionId::next();
        let fatal = Arc::new(Notify::new());
        let sender = Sender::spawn(
            write,
            config.send_mode,
            config.send_queue_limit,
            fatal.clone(),
            id,
        );
        let receiver = Receiver::new(read, config.recv_mode);
        let conn = Self {
            inner: Arc::new(ConnInner {
                id,
                peer,
                config,
                registry,
                sender,
                receiver,
                listeners: Mutex::new(Vec::new()),
                ping: Mutex::new(None),
                state: AtomicU8::new(STATE_OPEN),
                fatal,
                shutdown: Notify::new(),
            }),
        };

        let watch = conn.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch.inner.fatal.notified() => watch.close().await,
                _ = watch.inner.shutdown.notified() => {}
            }
        });

        tracing::debug!(%id, %peer, "connection open");
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queues an envelope for delivery. Never blocks; envelopes queued
    /// on a connection that is not open are dropped.
    pub fn send<E: Envelope>(&self, envelope: E) {
        if !self.is_open() {
            tracing::debug!(
                id = %self.inner.id,
                tag = envelope.type_id(),
                "envelope dropped, connection not open"
            );
            return;
        }
        self.inner.sender.enqueue(Box::new(envelope));
    }

    /// Pushes everything queued onto the socket and waits for the
    /// write to land. A write failure on the socket surfaces here.
    pub async fn flush(&self) -> Result<(), TransportError> {
        self.inner.sender.flush(self.inner.config.flush_timeout).await
    }

    /// Soft limit of the outbound queue.
    pub fn send_queue_limit(&self) -> usize {
        self.inner.sender.queue_limit()
    }

    /// Adjusts the outbound soft limit. Refused (returning `false`)
    /// when the queue already holds more envelopes than requested.
    pub fn set_send_queue_limit(&self, limit: usize) -> bool {
        self.inner.sender.set_queue_limit(limit)
    }

    /// Adjusts the timed-mode aggregation window, starting with the
    /// next batch. No effect in the other send modes.
    pub fn set_aggregation_window(&self, window: std::time::Duration) {
        self.inner.sender.set_window(window);
    }

    /// Begins inbound dispatch. In sync receive mode this is a no-op;
    /// dispatch happens in [`drain`](Connection::drain).
    pub fn start(&self) {
        self.inner.receiver.start(self.clone());
    }

    /// Sync receive mode: dispatches the envelopes that have already
    /// arrived and returns how many ran. Async mode: no-op.
    pub async fn drain(&self) -> Result<usize, TransportError> {
        receiver::drain(self).await
    }

    /// Sync receive mode: parks until inbound bytes are available.
    pub async fn wait_for_envelope(&self) -> Result<(), TransportError> {
        receiver::wait_for_envelope(self).await
    }

    /// Swaps the session context inbound behaviors run against.
    pub fn set_context(&self, ctx: Arc<SessionContext>) {
        self.inner.receiver.set_context(ctx);
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        {
            let mut listeners = self.inner.listeners.lock();
            if self.state() != ConnectionState::Closed {
                listeners.push(listener.clone());
                drop(listeners);
                if self.state() == ConnectionState::Open {
                    listener.on_created(self);
                }
                return;
            }
        }
        // Too late to observe anything else.
        listener.on_closed(self);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|kept| !Arc::ptr_eq(kept, listener));
        before != listeners.len()
    }

    /// Starts latency monitoring, or redirects reports if a monitor is
    /// already running. Fails with [`TransportError::PingConflict`] on
    /// a connection in echo mode.
    pub fn attach_ping_listener(
        &self,
        listener: Arc<dyn PingListener>,
    ) -> Result<(), TransportError> {
        if self.inner.receiver.echoes() {
            return Err(TransportError::PingConflict);
        }
        let mut slot = self.inner.ping.lock();
        match slot.as_ref() {
            Some(monitor) => monitor.swap_listener(listener),
            None => {
                *slot = Some(PingMonitor::spawn(
                    self.clone(),
                    listener,
                    self.inner.config.ping_interval,
                    self.inner.config.ping_grace,
                ));
            }
        }
        Ok(())
    }

    /// Makes this side reflect inbound probes back to the peer. Fails
    /// with [`TransportError::PingConflict`] while a ping listener is
    /// attached.
    pub fn set_echo_mode(&self, on: bool) -> Result<(), TransportError> {
        if on && self.inner.ping.lock().is_some() {
            return Err(TransportError::PingConflict);
        }
        self.inner.receiver.set_echo(on);
        Ok(())
    }

    /// Orderly shutdown: queue the close sentinel, flush, stop both
    /// halves, notify listeners. Safe to call any number of times;
    /// only the first call does anything.
    pub async fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(id = %self.inner.id, "closing connection");

        self.inner.receiver.stop();
        self.inner.sender.enqueue(Box::new(EndOfConnection));
        if let Err(error) = self.inner.sender.flush(self.inner.config.flush_timeout).await {
            tracing::debug!(id = %self.inner.id, %error, "final flush failed");
        }
        self.inner.sender.stop();
        self.inner.sender.join().await;

        let monitor = self.inner.ping.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        let listeners: Vec<_> = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in &listeners {
            listener.on_closed(self);
        }
        self.inner.shutdown.notify_one();
        tracing::info!(id = %self.inner.id, peer = %self.inner.peer, "connection closed");
    }

    pub(crate) fn receiver(&self) -> &Receiver {
        &self.inner.receiver
    }

    pub(crate) fn recv_mode(&self) -> RecvMode {
        self.inner.receiver.mode()
    }

    /// Routes a probe echo to the monitor, if one is attached.
    pub(crate) fn ping_echoed(&self, sequence: u8) {
        let monitor = self.inner.ping.lock().clone();
        if let Some(monitor) = monitor {
            monitor.echoed(sequence);
        }
    }

    /// Marks the connection broken. The watchdog task turns this into
    /// an orderly close without blocking the caller.
    pub(crate) fn signal_fatal(&self) {
        self.inner.fatal.notify_one();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_id_displays_with_prefix() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
    }
}
