//! Inbound half of a connection.
//!
//! Frames carry no length prefix, so decoding is incremental: the
//! receiver buffers socket bytes, peels complete frames off the front,
//! and refills on [`ProtocolError::Incomplete`]. Two tags are handled
//! here instead of going through registry dispatch: the close sentinel
//! tears the connection down, and latency probes are either echoed back
//! or fed to the local ping monitor.
//!
//! An undecodable frame is not fatal. Its type is unknown or its
//! payload malformed, and without a length prefix the only recovery is
//! to drop the buffered bytes and resynchronize on the next read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_proto::{Envelope, ProtocolError, SessionContext, WireReader, system};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::RecvMode;
use crate::connection::Connection;
use crate::error::TransportError;

struct ReadState {
    read: OwnedReadHalf,
    buf: Vec<u8>,
}

/// Handle to the inbound state. Owned by the connection; the dispatch
/// task (async mode) or the application's drain calls (sync mode) run
/// against it.
pub(crate) struct Receiver {
    mode: RecvMode,
    state: tokio::sync::Mutex<ReadState>,
    context: Mutex<Arc<SessionContext>>,
    echo: AtomicBool,
    stop: Notify,
    stopping: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub(crate) fn new(read: OwnedReadHalf, mode: RecvMode) -> Self {
        Self {
            mode,
            state: tokio::sync::Mutex::new(ReadState { read, buf: Vec::with_capacity(4096) }),
            context: Mutex::new(Arc::new(())),
            echo: AtomicBool::new(false),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn mode(&self) -> RecvMode {
        self.mode
    }

    pub(crate) fn context(&self) -> Arc<SessionContext> {
        self.context.lock().clone()
    }

    pub(crate) fn set_context(&self, ctx: Arc<SessionContext>) {
        *self.context.lock() = ctx;
    }

    pub(crate) fn echoes(&self) -> bool {
        self.echo.load(Ordering::Acquire)
    }

    pub(crate) fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::Release);
    }

    /// Starts the dispatch task in async mode. Sync mode has no task;
    /// the application pulls via [`drain`].
    pub(crate) fn start(&self, conn: Connection) {
        if matches!(self.mode, RecvMode::Sync { .. }) {
            return;
        }
        let mut slot = self.task.lock();
        if slot.is_none() {
            *slot = Some(tokio::spawn(run_async(conn)));
        }
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_one();
    }
}

enum Step {
    /// One frame decoded and dispatched; this many bytes consumed.
    Dispatched(usize),
    /// The buffer holds only a partial frame.
    NeedMore,
    /// The frame could not be decoded; drop the buffer and resume on
    /// the next read.
    Resync,
    /// The peer sent the close sentinel.
    Goodbye,
}

fn process_one(conn: &Connection, buf: &[u8]) -> Step {
    let mut r = WireReader::new(buf);
    let tag = match r.read_tag() {
        Ok(tag) => tag,
        Err(ProtocolError::Incomplete) => return Step::NeedMore,
        Err(error) => {
            tracing::warn!(id = %conn.id(), %error, "unreadable frame header");
            return Step::Resync;
        }
    };

    match tag.as_str() {
        system::END_OF_CONNECTION => Step::Goodbye,
        system::PING => match r.read_u8() {
            Ok(sequence) => {
                if conn.receiver().echoes() {
                    conn.send(system::Ping { sequence });
                } else {
                    conn.ping_echoed(sequence);
                }
                Step::Dispatched(r.position())
            }
            Err(ProtocolError::Incomplete) => Step::NeedMore,
            Err(_) => Step::Resync,
        },
        _ => match conn.registry().resolve(&tag) {
            Ok(mut envelope) => match envelope.decode(&mut r) {
                Ok(()) => {
                    let ctx = conn.receiver().context();
                    envelope.apply(&*ctx);
                    Step::Dispatched(r.position())
                }
                Err(ProtocolError::Incomplete) => Step::NeedMore,
                Err(error) => {
                    tracing::warn!(id = %conn.id(), %tag, %error, "frame dropped");
                    Step::Resync
                }
            },
            Err(error) => {
                tracing::warn!(id = %conn.id(), %error, "frame dropped");
                Step::Resync
            }
        },
    }
}

/// Dispatch task body for async mode. Exits on stop, on the close
/// sentinel, and on any read failure.
async fn run_async(conn: Connection) {
    let receiver = conn.receiver();
    let id = conn.id();
    let mut guard = receiver.state.lock().await;

    loop {
        loop {
            if receiver.stopping.load(Ordering::Acquire) {
                return;
            }
            match process_one(&conn, guard.buf.as_slice()) {
                Step::Dispatched(n) => {
                    guard.buf.drain(..n);
                }
                Step::Resync => guard.buf.clear(),
                Step::NeedMore => break,
                Step::Goodbye => {
                    tracing::debug!(%id, "peer announced end of connection");
                    conn.signal_fatal();
                    return;
                }
            }
        }

        let state = &mut *guard;
        tokio::select! {
            _ = receiver.stop.notified() => return,
            read = state.read.read_buf(&mut state.buf) => match read {
                Ok(0) => {
                    tracing::debug!(%id, "peer closed the socket");
                    conn.signal_fatal();
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%id, %error, "read failed, shutting connection down");
                    conn.signal_fatal();
                    return;
                }
            },
        }
    }
}

/// Sync-mode pull: dispatches what has already arrived, up to the
/// configured ceiling, without waiting for more.
pub(crate) async fn drain(conn: &Connection) -> Result<usize, TransportError> {
    let receiver = conn.receiver();
    let RecvMode::Sync { max_per_drain } = receiver.mode else {
        return Ok(0);
    };

    let mut guard = receiver.state.lock().await;
    let state = &mut *guard;
    let mut dispatched = 0;
    let mut chunk = [0u8; 4096];

    while dispatched < max_per_drain {
        match process_one(conn, state.buf.as_slice()) {
            Step::Dispatched(n) => {
                state.buf.drain(..n);
                dispatched += 1;
            }
            Step::Resync => state.buf.clear(),
            Step::Goodbye => {
                tracing::debug!(id = %conn.id(), "peer announced end of connection");
                conn.signal_fatal();
                break;
            }
            Step::NeedMore => match state.read.try_read(&mut chunk) {
                Ok(0) => {
                    conn.signal_fatal();
                    break;
                }
                Ok(n) => state.buf.extend_from_slice(&chunk[..n]),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    conn.signal_fatal();
                    return Err(error.into());
                }
            },
        }
    }

    Ok(dispatched)
}

/// Sync-mode wait: parks until at least one frame byte is available.
pub(crate) async fn wait_for_envelope(conn: &Connection) -> Result<(), TransportError> {
    let receiver = conn.receiver();
    if !matches!(receiver.mode, RecvMode::Sync { .. }) {
        return Ok(());
    }
    let guard = receiver.state.lock().await;
    if !guard.buf.is_empty() {
        return Ok(());
    }
    guard.read.readable().await?;
    Ok(())
}

/// Server handshake: reads exactly one registration envelope off the
/// socket before normal dispatch starts. Any other frame is a protocol
/// violation.
pub(crate) async fn read_registration(conn: &Connection) -> Result<String, TransportError> {
    let receiver = conn.receiver();
    let mut guard = receiver.state.lock().await;
    let state = &mut *guard;

    loop {
        let mut r = WireReader::new(state.buf.as_slice());
        match r.read_tag() {
            Ok(tag) if tag == system::REGISTER => {
                let mut register = system::Register::default();
                match register.decode(&mut r) {
                    Ok(()) => {
                        let n = r.position();
                        state.buf.drain(..n);
                        return Ok(register.credential);
                    }
                    Err(ProtocolError::Incomplete) => {}
                    Err(error) => return Err(error.into()),
                }
            }
            Ok(tag) => {
                return Err(ProtocolError::Malformed(format!(
                    "expected registration, got `{tag}`"
                ))
                .into());
            }
            Err(ProtocolError::Incomplete) => {}
            Err(error) => return Err(error.into()),
        }

        if state.read.read_buf(&mut state.buf).await? == 0 {
            return Err(TransportError::Closed);
        }
    }
}
