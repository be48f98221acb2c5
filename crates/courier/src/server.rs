//! Server acceptor.
//!
//! The accept loop owns the lifecycle of the listening endpoint: it
//! resolves the configured target, binds, and accepts with a short
//! timeout so it can notice a named endpoint whose address moved and an
//! interface that went away. While the endpoint is unavailable the
//! server keeps retrying on a long period rather than dying, reporting
//! the outage to its listeners.
//!
//! Admission is type-enforced: the [`AccessDecider`] receives a
//! [`Registration`] it must consume through exactly one of
//! [`Registration::accept`] or [`Registration::reject`] to produce the
//! [`Verdict`] it has to return.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use courier_proto::{Envelope, MessageSet, Registry, SessionContext, codes, system};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{BindTarget, ServerConfig};
use crate::connection::{Connection, ConnectionListener};
use crate::receiver;

/// Admission ticket for one inbound connection. Consumed by the
/// verdict: accepting or rejecting takes `self`, so a decider cannot
/// do both and cannot do neither.
pub struct Registration {
    conn: Connection,
}

impl Registration {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Admits the connection: installs the session context, confirms
    /// to the peer, and starts inbound dispatch.
    pub async fn accept(self, ctx: Option<Arc<SessionContext>>) -> Verdict {
        if let Some(ctx) = ctx {
            self.conn.set_context(ctx);
        }
        self.conn.send(system::Welcome);
        if let Err(error) = self.conn.flush().await {
            // The failed write already put the connection on its way
            // down.
            tracing::warn!(id = %self.conn.id(), %error, "welcome not delivered");
            return Verdict { accepted: false };
        }
        self.conn.start();
        tracing::debug!(id = %self.conn.id(), "connection accepted");
        Verdict { accepted: true }
    }

    /// Turns the connection away with a coded refusal, then closes it.
    pub async fn reject(self, code: u16, message: impl Into<String>) -> Verdict {
        let message = message.into();
        tracing::debug!(id = %self.conn.id(), code, "connection rejected");
        self.conn.send(system::Refusal { code, message });
        let _ = self.conn.flush().await;
        self.conn.close().await;
        Verdict { accepted: false }
    }
}

/// Proof that a [`Registration`] was settled.
#[derive(Debug)]
pub struct Verdict {
    accepted: bool,
}

/// Application hook deciding whether an inbound connection may stay.
pub trait AccessDecider: Send + Sync + 'static {
    fn decide(
        &self,
        credential: &str,
        registration: Registration,
    ) -> impl Future<Output = Verdict> + Send;
}

/// Decider that admits everyone with no session context.
pub struct AcceptAll;

impl AccessDecider for AcceptAll {
    fn decide(
        &self,
        _credential: &str,
        registration: Registration,
    ) -> impl Future<Output = Verdict> + Send {
        async move { registration.accept(None).await }
    }
}

/// Observes the listening endpoint's availability.
pub trait ServerListener: Send + Sync + 'static {
    /// The endpoint could not be bound; the server keeps retrying.
    fn interface_down(&self, _endpoint: &str) {}

    /// The endpoint is bound. `changed` is set when the address differs
    /// from the previous successful bind.
    fn interface_up(&self, _addr: SocketAddr, _changed: bool) {}
}

const STATE_BINDING: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_INTERRUPTED: u8 = 2;
const STATE_STOPPED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Resolving and binding the endpoint.
    Binding,
    /// Bound and accepting.
    Listening,
    /// The endpoint is unavailable; retrying on the rebind period.
    Interrupted,
    /// The accept loop has exited.
    Stopped,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<Registry>,
    table: Mutex<Vec<Option<Connection>>>,
    listeners: Mutex<Vec<Arc<dyn ServerListener>>>,
    locked: AtomicBool,
    state: AtomicU8,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: Notify,
    stopping: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        let raw = match state {
            ServerState::Binding => STATE_BINDING,
            ServerState::Listening => STATE_LISTENING,
            ServerState::Interrupted => STATE_INTERRUPTED,
            ServerState::Stopped => STATE_STOPPED,
        };
        self.state.store(raw, Ordering::Release);
    }

    fn state(&self) -> ServerState {
        match self.state.load(Ordering::Acquire) {
            STATE_BINDING => ServerState::Binding,
            STATE_LISTENING => ServerState::Listening,
            STATE_INTERRUPTED => ServerState::Interrupted,
            _ => ServerState::Stopped,
        }
    }

    fn notify_interface_down(&self, endpoint: &str) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.interface_down(endpoint);
        }
    }

    fn notify_interface_up(&self, addr: SocketAddr, changed: bool) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener.interface_up(addr, changed);
        }
    }
}

/// Frees a connection's table slot when it closes.
struct SlotReaper {
    shared: Weak<Shared>,
}

impl ConnectionListener for SlotReaper {
    fn on_closed(&self, conn: &Connection) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut table = shared.table.lock();
        for slot in table.iter_mut() {
            if slot.as_ref().is_some_and(|held| held.id() == conn.id()) {
                *slot = None;
                tracing::debug!(id = %conn.id(), "table slot released");
                break;
            }
        }
    }
}

pub struct Server<D: AccessDecider> {
    shared: Arc<Shared>,
    decider: Arc<D>,
    reaper: Arc<SlotReaper>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: AccessDecider> Server<D> {
    pub fn new(config: ServerConfig, decider: D) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(vec![None; config.max_connections]),
            config,
            registry: Arc::new(Registry::new()),
            listeners: Mutex::new(Vec::new()),
            locked: AtomicBool::new(false),
            state: AtomicU8::new(STATE_BINDING),
            local_addr: Mutex::new(None),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        });
        let reaper = Arc::new(SlotReaper { shared: Arc::downgrade(&shared) });
        Self { shared, decider: Arc::new(decider), reaper, task: Mutex::new(None) }
    }

    /// Registry the server resolves inbound envelopes against. Extend
    /// it with the application's message sets before starting.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn register_messages(&self, set: &MessageSet) -> usize {
        self.shared.registry.extend(set)
    }

    /// Starts the accept loop. Subsequent calls are no-ops.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(accept_loop(
            self.shared.clone(),
            self.decider.clone(),
            self.reaper.clone(),
        )));
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Address actually bound, once the server reaches `Listening`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// While locked, new connections are refused with
    /// `codes::ACCESS_LOCKED`; established ones are untouched.
    pub fn set_locked(&self, locked: bool) {
        self.shared.locked.store(locked, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.shared.locked.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.table.lock().iter().flatten().count()
    }

    /// Queues an envelope on every live connection.
    pub fn broadcast<E: Envelope + Clone>(&self, envelope: E) {
        let table = self.shared.table.lock();
        for conn in table.iter().flatten() {
            conn.send(envelope.clone());
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.shared.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServerListener>) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|kept| !Arc::ptr_eq(kept, listener));
        before != listeners.len()
    }

    /// Stops the accept loop. Established connections stay up; use
    /// [`close_all`](Server::close_all) to take them down too.
    pub async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.stop.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.set_state(ServerState::Stopped);
    }

    /// Closes every connection in the table.
    pub async fn close_all(&self) {
        let held: Vec<Connection> = {
            let mut table = self.shared.table.lock();
            table.iter_mut().filter_map(Option::take).collect()
        };
        for conn in held {
            conn.close().await;
        }
    }
}

async fn accept_loop<D: AccessDecider>(
    shared: Arc<Shared>,
    decider: Arc<D>,
    reaper: Arc<SlotReaper>,
) {
    let config = shared.config.clone();
    let mut bound: Option<SocketAddr> = None;

    'run: while !shared.stopping.load(Ordering::Acquire) {
        shared.set_state(ServerState::Binding);

        // Bind, retrying on the rebind period while the endpoint is
        // unavailable.
        let listener = loop {
            let attempt = async {
                TcpListener::bind(config.target.resolve(config.port).await?).await
            };
            match attempt.await {
                Ok(listener) => break listener,
                Err(error) => {
                    let endpoint = config.target.describe();
                    tracing::warn!(%endpoint, %error, "endpoint unavailable, retrying");
                    shared.set_state(ServerState::Interrupted);
                    shared.notify_interface_down(&endpoint);
                    tokio::select! {
                        _ = shared.stop.notified() => break 'run,
                        _ = tokio::time::sleep(config.rebind_period) => {}
                    }
                    shared.set_state(ServerState::Binding);
                }
            }
        };

        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::error!(%error, "bound endpoint has no local address");
                tokio::select! {
                    _ = shared.stop.notified() => break 'run,
                    _ = tokio::time::sleep(config.rebind_period) => {}
                }
                continue 'run;
            }
        };
        let changed = bound.is_some_and(|previous| previous != addr);
        bound = Some(addr);
        *shared.local_addr.lock() = Some(addr);
        shared.set_state(ServerState::Listening);
        shared.notify_interface_up(addr, changed);
        tracing::info!(%addr, "listening");

        loop {
            if shared.stopping.load(Ordering::Acquire) {
                break 'run;
            }
            tokio::select! {
                _ = shared.stop.notified() => break 'run,
                accepted = timeout(config.accept_timeout, listener.accept()) => match accepted {
                    Ok(Ok((stream, peer))) => {
                        let shared = shared.clone();
                        let decider = decider.clone();
                        let reaper = reaper.clone();
                        tokio::spawn(admit(shared, decider, reaper, stream, peer));
                    }
                    Ok(Err(error)) => tracing::error!(%error, "accept failed"),
                    Err(_) => {
                        // Idle period. A named endpoint may have moved;
                        // re-resolve and rebind if so.
                        if let BindTarget::Named { .. } = &config.target {
                            match config.target.resolve(config.port).await {
                                Ok(want) if want.ip() != addr.ip() => {
                                    tracing::info!(from = %addr, to = %want, "endpoint moved, rebinding");
                                    continue 'run;
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    tracing::warn!(%error, "endpoint lost, rebinding");
                                    continue 'run;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    shared.set_state(ServerState::Stopped);
    tracing::info!("server stopped");
}

/// Runs one inbound socket through admission: capacity and lock checks,
/// the registration handshake, then the application's verdict.
async fn admit<D: AccessDecider>(
    shared: Arc<Shared>,
    decider: Arc<D>,
    reaper: Arc<SlotReaper>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let conn = match Connection::open(
        stream,
        shared.config.connection.clone(),
        shared.registry.clone(),
    ) {
        Ok(conn) => conn,
        Err(error) => {
            tracing::warn!(%peer, %error, "could not adopt inbound socket");
            return;
        }
    };
    tracing::debug!(id = %conn.id(), %peer, "inbound connection");

    // Capacity and lock checks happen under the table lock so the
    // ceiling stays exact under concurrent admissions.
    let refusal = {
        let mut table = shared.table.lock();
        match table.iter_mut().find(|slot| slot.is_none()) {
            None => Some((codes::MAX_CONNECTIONS, "server full")),
            Some(_) if shared.locked.load(Ordering::Acquire) => {
                Some((codes::ACCESS_LOCKED, "server not admitting connections"))
            }
            Some(slot) => {
                *slot = Some(conn.clone());
                None
            }
        }
    };
    if let Some((code, message)) = refusal {
        conn.send(system::Refusal { code, message: message.to_string() });
        let _ = conn.flush().await;
        conn.close().await;
        return;
    }
    conn.add_listener(reaper);

    let credential =
        match timeout(shared.config.handshake_timeout, receiver::read_registration(&conn)).await {
            Ok(Ok(credential)) => credential,
            Ok(Err(error)) => {
                tracing::warn!(id = %conn.id(), %error, "handshake failed");
                conn.close().await;
                return;
            }
            Err(_) => {
                tracing::warn!(id = %conn.id(), "handshake timed out");
                conn.close().await;
                return;
            }
        };

    let verdict = decider.decide(&credential, Registration { conn: conn.clone() }).await;
    tracing::debug!(id = %conn.id(), accepted = verdict.accepted, "admission settled");
}
