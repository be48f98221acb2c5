//! Client connector.
//!
//! [`Connector`] drives one connect attempt: TCP connect, registry
//! setup, the credential handshake, and the wait for the server's
//! verdict. The whole attempt runs under one deadline and can be
//! canceled from another task; either way the half-built connection is
//! torn down before the error is returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_proto::{MessageSet, Registry, SessionContext, system};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::config::{ConnectionConfig, RecvMode};
use crate::connection::Connection;
use crate::error::TransportError;

pub struct Connector {
    config: ConnectionConfig,
    canceled: AtomicBool,
    cancel: Notify,
    in_flight: Mutex<Option<Connection>>,
}

impl Connector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            canceled: AtomicBool::new(false),
            cancel: Notify::new(),
            in_flight: Mutex::new(None),
        }
    }

    /// Aborts the attempt in flight, and any future one, with
    /// [`TransportError::Canceled`]. Callable from any task.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.cancel.notify_one();
    }

    /// Runs one connect attempt to `host:port` under `deadline`.
    ///
    /// On success the returned connection is dispatching inbound
    /// envelopes against `session_context`. On failure the specific
    /// cause is in the error; [`TransportError::connect_code`] gives
    /// the numeric form.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        credential: &str,
        session_context: Option<Arc<SessionContext>>,
        message_sets: &[MessageSet],
        deadline: Duration,
    ) -> Result<Connection, TransportError> {
        if self.canceled.load(Ordering::Acquire) {
            return Err(TransportError::Canceled);
        }

        let outcome = tokio::select! {
            _ = self.cancel.notified() => Err(TransportError::Canceled),
            attempt = tokio::time::timeout(
                deadline,
                self.attempt(host, port, credential, session_context, message_sets),
            ) => match attempt {
                Err(_) => Err(TransportError::Timeout("connect")),
                Ok(outcome) => outcome,
            },
        };

        match outcome {
            Ok(conn) => {
                self.in_flight.lock().take();
                Ok(conn)
            }
            Err(error) => {
                // Cancel and timeout drop the attempt mid-flight; make
                // sure whatever it built is torn down.
                let abandoned = self.in_flight.lock().take();
                if let Some(conn) = abandoned {
                    conn.close().await;
                }
                tracing::debug!(%error, code = error.connect_code(), "connect failed");
                Err(error)
            }
        }
    }

    async fn attempt(
        &self,
        host: &str,
        port: u16,
        credential: &str,
        session_context: Option<Arc<SessionContext>>,
        message_sets: &[MessageSet],
    ) -> Result<Connection, TransportError> {
        tracing::debug!(host, port, "connecting");
        let stream = TcpStream::connect((host, port)).await?;

        let registry = Arc::new(Registry::new());
        for set in message_sets {
            registry.extend(set);
        }

        let conn = Connection::open(stream, self.config.clone(), registry)?;
        *self.in_flight.lock() = Some(conn.clone());

        // The gate rides along as session context until the verdict
        // frame resolves it.
        let gate = Arc::new(system::ConnectGate::new());
        conn.set_context(gate.clone());

        conn.send(system::Register { credential: credential.to_string() });
        conn.flush().await?;

        let verdict = match conn.recv_mode() {
            RecvMode::Sync { .. } => loop {
                conn.wait_for_envelope().await?;
                conn.drain().await?;
                if let Some(verdict) = gate.verdict() {
                    break verdict;
                }
                if !conn.is_open() {
                    return Err(TransportError::Closed);
                }
            },
            RecvMode::Async => {
                conn.start();
                gate.wait().await
            }
        };

        match verdict {
            Ok(()) => {
                let ctx = session_context.unwrap_or_else(|| Arc::new(()) as Arc<SessionContext>);
                conn.set_context(ctx);
                tracing::info!(id = %conn.id(), host, port, "connected");
                Ok(conn)
            }
            Err((code, message)) => {
                conn.close().await;
                self.in_flight.lock().take();
                Err(TransportError::Refused { code, message })
            }
        }
    }
}
