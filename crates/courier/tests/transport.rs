//! End-to-end tests over real sockets on the loopback interface.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::proto::{ProtocolError, WireReader, WireWriter};
use courier::{
    AcceptAll, AccessDecider, Behavior, BindTarget, Connection, ConnectionConfig, ConnectionListener,
    Connector, Envelope, MessageSet, PingListener, PingReport, RecvMode, Registration, Registry,
    SendMode, Server, ServerConfig, ServerListener, ServerState, SessionContext, TransportError,
    Verdict, codes,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

#[derive(Debug, Default, Clone)]
struct Say {
    text: String,
}

impl Envelope for Say {
    fn type_id(&self) -> &'static str {
        "chat.say"
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_string(&self.text)
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.text = r.read_string()?;
        Ok(())
    }
}

impl Behavior for Say {
    fn apply(&self, ctx: &SessionContext) {
        if let Some(inbox) = ctx.downcast_ref::<Inbox>() {
            inbox.push(&self.text);
        }
    }
}

/// An envelope no receiver registers: exercises unknown-type recovery.
#[derive(Debug, Default)]
struct Mystery;

impl Envelope for Mystery {
    fn type_id(&self) -> &'static str {
        "test.mystery"
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u32(0xDEAD_BEEF);
        Ok(())
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        r.read_u32()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inbox {
    texts: Mutex<Vec<String>>,
}

impl Inbox {
    fn push(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }

    fn len(&self) -> usize {
        self.texts.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

fn chat_set() -> MessageSet {
    MessageSet::new("chat").insert::<Say>()
}

fn chat_registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    registry.extend(&chat_set());
    registry
}

/// Decider that admits everyone and keeps each session's inbox visible
/// to the test.
#[derive(Clone, Default)]
struct InboxDecider {
    inboxes: Arc<Mutex<Vec<Arc<Inbox>>>>,
}

impl InboxDecider {
    fn inbox(&self, index: usize) -> Arc<Inbox> {
        self.inboxes.lock().unwrap()[index].clone()
    }
}

impl AccessDecider for InboxDecider {
    fn decide(
        &self,
        _credential: &str,
        registration: Registration,
    ) -> impl Future<Output = Verdict> + Send {
        let inbox = Arc::new(Inbox::default());
        self.inboxes.lock().unwrap().push(inbox.clone());
        async move { registration.accept(Some(inbox as Arc<SessionContext>)).await }
    }
}

/// Decider that only lets the magic word through.
struct Doorman;

impl AccessDecider for Doorman {
    fn decide(
        &self,
        credential: &str,
        registration: Registration,
    ) -> impl Future<Output = Verdict> + Send {
        let admitted = credential == "sesame";
        async move {
            if admitted {
                registration.accept(None).await
            } else {
                registration.reject(codes::BAD_CREDENTIAL, "wrong password").await
            }
        }
    }
}

struct CloseCount {
    closes: AtomicUsize,
}

impl ConnectionListener for CloseCount {
    fn on_closed(&self, _conn: &Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PingLog {
    reports: Mutex<Vec<PingReport>>,
}

impl PingListener for PingLog {
    fn ping_computed(&self, report: PingReport) {
        self.reports.lock().unwrap().push(report);
    }
}

#[derive(Default)]
struct EndpointLog {
    events: Mutex<Vec<String>>,
}

impl ServerListener for EndpointLog {
    fn interface_down(&self, endpoint: &str) {
        self.events.lock().unwrap().push(format!("down {endpoint}"));
    }

    fn interface_up(&self, addr: std::net::SocketAddr, changed: bool) {
        self.events.lock().unwrap().push(format!("up {addr} changed={changed}"));
    }
}

impl EndpointLog {
    fn saw(&self, prefix: &str) -> bool {
        self.events.lock().unwrap().iter().any(|event| event.starts_with(prefix))
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn local_config() -> ServerConfig {
    let mut config = ServerConfig::new(BindTarget::Addr(Ipv4Addr::LOCALHOST.into()), 0);
    config.accept_timeout = Duration::from_millis(200);
    config.rebind_period = Duration::from_millis(100);
    config
}

async fn start_server<D: AccessDecider>(config: ServerConfig, decider: D) -> (Server<D>, u16) {
    let server = Server::new(config, decider);
    server.register_messages(&chat_set());
    server.start();
    let mut port = None;
    for _ in 0..500 {
        if let Some(addr) = server.local_addr() {
            port = Some(addr.port());
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    (server, port.expect("server never bound"))
}

async fn connect(
    port: u16,
    config: ConnectionConfig,
    ctx: Option<Arc<SessionContext>>,
) -> Result<Connection, TransportError> {
    Connector::new(config)
        .connect("127.0.0.1", port, "sesame", ctx, &[chat_set()], Duration::from_secs(5))
        .await
}

/// Two connections over a real socket pair, no server in between.
async fn raw_pair(a_config: ConnectionConfig, b_config: ConnectionConfig) -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (outbound, inbound) =
        tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap().0 });
    let a = Connection::open(outbound.unwrap(), a_config, chat_registry()).unwrap();
    let b = Connection::open(inbound, b_config, chat_registry()).unwrap();
    (a, b)
}

fn numbered(count: usize) -> Vec<String> {
    (0..count).map(|n| format!("message {n}")).collect()
}

#[tokio::test]
async fn immediate_mode_delivers_in_order() {
    let decider = InboxDecider::default();
    let (_server, port) = start_server(local_config(), decider.clone()).await;
    let conn = connect(port, ConnectionConfig::default(), None).await.unwrap();

    let expected = numbered(30);
    for text in &expected {
        conn.send(Say { text: text.clone() });
    }

    let inbox = decider.inbox(0);
    eventually("all envelopes to arrive", || inbox.len() == 30).await;
    assert_eq!(inbox.snapshot(), expected);
    conn.close().await;
}

#[tokio::test]
async fn timed_mode_batches_without_reordering() {
    let decider = InboxDecider::default();
    let (_server, port) = start_server(local_config(), decider.clone()).await;

    let mut config = ConnectionConfig::default();
    config.send_mode = SendMode::timed();
    let conn = connect(port, config, None).await.unwrap();

    // Three times the batch limit, so delivery spans several batches.
    let expected = numbered(30);
    for text in &expected {
        conn.send(Say { text: text.clone() });
    }

    let inbox = decider.inbox(0);
    eventually("all batches to arrive", || inbox.len() == 30).await;
    assert_eq!(inbox.snapshot(), expected);
    conn.close().await;
}

#[tokio::test]
async fn user_flush_mode_holds_until_flush() {
    let decider = InboxDecider::default();
    let (_server, port) = start_server(local_config(), decider.clone()).await;

    let mut config = ConnectionConfig::default();
    config.send_mode = SendMode::UserFlush;
    let conn = connect(port, config, None).await.unwrap();

    let expected = numbered(5);
    for text in &expected {
        conn.send(Say { text: text.clone() });
    }

    let inbox = decider.inbox(0);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(inbox.len(), 0, "nothing should arrive before the flush");

    conn.flush().await.unwrap();
    eventually("flushed envelopes to arrive", || inbox.len() == 5).await;
    assert_eq!(inbox.snapshot(), expected);
    conn.close().await;
}

#[tokio::test]
async fn server_answers_through_the_session_context() {
    let decider = InboxDecider::default();
    let (server, port) = start_server(local_config(), decider.clone()).await;

    let client_inbox = Arc::new(Inbox::default());
    let conn = connect(
        port,
        ConnectionConfig::default(),
        Some(client_inbox.clone() as Arc<SessionContext>),
    )
    .await
    .unwrap();

    conn.send(Say { text: "hello".into() });
    let server_inbox = decider.inbox(0);
    eventually("the greeting to arrive", || server_inbox.len() == 1).await;

    server.broadcast(Say { text: "welcome in".into() });
    eventually("the broadcast to arrive", || client_inbox.len() == 1).await;
    assert_eq!(client_inbox.snapshot(), vec!["welcome in".to_string()]);
    conn.close().await;
}

#[tokio::test]
async fn wrong_credential_is_refused_with_code() {
    let (_server, port) = start_server(local_config(), Doorman).await;

    let err = Connector::new(ConnectionConfig::default())
        .connect("127.0.0.1", port, "mellon", None, &[chat_set()], Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        TransportError::Refused { code, ref message } => {
            assert_eq!(code, codes::BAD_CREDENTIAL);
            assert_eq!(message, "wrong password");
        }
        other => panic!("expected a refusal, got {other}"),
    }
    assert_eq!(err.connect_code(), codes::BAD_CREDENTIAL);
}

#[tokio::test]
async fn full_table_refuses_with_code() {
    let mut config = local_config();
    config.max_connections = 1;
    let (_server, port) = start_server(config, AcceptAll).await;

    let first = connect(port, ConnectionConfig::default(), None).await.unwrap();
    let err = connect(port, ConnectionConfig::default(), None).await.unwrap_err();
    assert!(matches!(err, TransportError::Refused { code, .. } if code == codes::MAX_CONNECTIONS));

    // Closing the first connection frees its slot.
    first.close().await;
    let mut readmitted = None;
    for _ in 0..50 {
        match connect(port, ConnectionConfig::default(), None).await {
            Ok(conn) => {
                readmitted = Some(conn);
                break;
            }
            Err(_) => sleep(Duration::from_millis(50)).await,
        }
    }
    readmitted.expect("slot never freed").close().await;
}

#[tokio::test]
async fn locked_server_refuses_until_unlocked() {
    let (server, port) = start_server(local_config(), AcceptAll).await;

    server.set_locked(true);
    let err = connect(port, ConnectionConfig::default(), None).await.unwrap_err();
    assert!(matches!(err, TransportError::Refused { code, .. } if code == codes::ACCESS_LOCKED));

    server.set_locked(false);
    let conn = connect(port, ConnectionConfig::default(), None).await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_once() {
    let (a, b) = raw_pair(ConnectionConfig::default(), ConnectionConfig::default()).await;
    b.start();

    let count = Arc::new(CloseCount { closes: AtomicUsize::new(0) });
    a.add_listener(count.clone());

    a.close().await;
    a.close().await;
    assert_eq!(count.closes.load(Ordering::SeqCst), 1);
    assert!(!a.is_open());

    // The close sentinel takes the peer down too.
    eventually("the peer to notice the close", || !b.is_open()).await;
}

#[tokio::test]
async fn sync_receiver_recovers_after_unknown_type() {
    let mut sync_config = ConnectionConfig::default();
    sync_config.recv_mode = RecvMode::sync();
    let (a, b) = raw_pair(ConnectionConfig::default(), sync_config).await;

    let inbox = Arc::new(Inbox::default());
    b.set_context(inbox.clone());

    a.send(Mystery);
    a.flush().await.unwrap();
    b.wait_for_envelope().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(b.drain().await.unwrap(), 0, "an unknown type dispatches nothing");
    assert!(b.is_open(), "an unknown type must not kill the connection");

    a.send(Say { text: "after the glitch".into() });
    a.flush().await.unwrap();
    b.wait_for_envelope().await.unwrap();
    let mut dispatched = 0;
    for _ in 0..100 {
        dispatched += b.drain().await.unwrap();
        if dispatched == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatched, 1);
    assert_eq!(inbox.snapshot(), vec!["after the glitch".to_string()]);

    a.close().await;
}

#[tokio::test]
async fn sync_drain_honors_its_ceiling() {
    let mut sync_config = ConnectionConfig::default();
    sync_config.recv_mode = RecvMode::Sync { max_per_drain: 5 };
    let (a, b) = raw_pair(ConnectionConfig::default(), sync_config).await;

    let inbox = Arc::new(Inbox::default());
    b.set_context(inbox.clone());

    for text in numbered(12) {
        a.send(Say { text });
    }
    a.flush().await.unwrap();
    b.wait_for_envelope().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(b.drain().await.unwrap(), 5);
    assert_eq!(b.drain().await.unwrap(), 5);
    assert_eq!(b.drain().await.unwrap(), 2);
    assert_eq!(inbox.snapshot(), numbered(12));

    a.close().await;
}

#[tokio::test]
async fn ping_round_trip_reports_latency() {
    let mut monitor_config = ConnectionConfig::default();
    monitor_config.ping_interval = Duration::from_millis(50);
    monitor_config.ping_grace = Duration::from_millis(50);
    let (a, b) = raw_pair(monitor_config, ConnectionConfig::default()).await;

    b.set_echo_mode(true).unwrap();
    b.start();
    a.start();

    let log = Arc::new(PingLog::default());
    a.attach_ping_listener(log.clone()).unwrap();

    eventually("a latency sample", || {
        log.reports.lock().unwrap().iter().any(|r| matches!(r, PingReport::Latency(_)))
    })
    .await;

    a.close().await;
    let reports = log.reports.lock().unwrap().clone();
    assert_eq!(*reports.last().unwrap(), PingReport::ConnectionClosed);
}

#[tokio::test]
async fn missed_probes_report_failed_once_each() {
    let mut monitor_config = ConnectionConfig::default();
    monitor_config.ping_interval = Duration::from_millis(40);
    monitor_config.ping_grace = Duration::from_millis(30);
    // The peer never echoes: every probe must fail.
    let (a, b) = raw_pair(monitor_config, ConnectionConfig::default()).await;
    a.start();
    b.start();

    let log = Arc::new(PingLog::default());
    a.attach_ping_listener(log.clone()).unwrap();

    eventually("two failed probes", || {
        log.reports.lock().unwrap().iter().filter(|r| matches!(r, PingReport::Failed)).count() >= 2
    })
    .await;
    assert!(
        !log.reports.lock().unwrap().iter().any(|r| matches!(r, PingReport::Latency(_))),
        "no echo, no latency"
    );

    a.close().await;
}

#[tokio::test]
async fn echo_mode_and_monitoring_exclude_each_other() {
    let (a, b) = raw_pair(ConnectionConfig::default(), ConnectionConfig::default()).await;

    a.set_echo_mode(true).unwrap();
    let err = a.attach_ping_listener(Arc::new(PingLog::default())).unwrap_err();
    assert!(matches!(err, TransportError::PingConflict));
    a.set_echo_mode(false).unwrap();

    a.attach_ping_listener(Arc::new(PingLog::default())).unwrap();
    let err = a.set_echo_mode(true).unwrap_err();
    assert!(matches!(err, TransportError::PingConflict));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn occupied_port_reports_down_then_recovers() {
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let mut config = local_config();
    config.port = port;
    let server = Server::new(config, AcceptAll);
    server.register_messages(&chat_set());

    let log = Arc::new(EndpointLog::default());
    server.add_listener(log.clone());
    server.start();

    eventually("the outage report", || log.saw("down")).await;
    assert!(matches!(server.state(), ServerState::Interrupted | ServerState::Binding));

    drop(blocker);
    eventually("the endpoint to come up", || log.saw("up")).await;
    eventually("the server to listen", || server.state() == ServerState::Listening).await;

    let conn = connect(port, ConnectionConfig::default(), None).await.unwrap();
    conn.close().await;
    server.stop().await;
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn cancel_aborts_a_connect_in_flight() {
    // A listener that never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let connector = Arc::new(Connector::new(ConnectionConfig::default()));
    let attempt = {
        let connector = connector.clone();
        tokio::spawn(async move {
            connector
                .connect("127.0.0.1", port, "sesame", None, &[chat_set()], Duration::from_secs(30))
                .await
        })
    };

    sleep(Duration::from_millis(100)).await;
    connector.cancel();

    let err = attempt.await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::Canceled));
    assert_eq!(err.connect_code(), codes::CONNECT_CANCELED);
}

#[tokio::test]
async fn connect_times_out_against_a_mute_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let err = Connector::new(ConnectionConfig::default())
        .connect("127.0.0.1", port, "sesame", None, &[chat_set()], Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)));
    assert_eq!(err.connect_code(), codes::CONNECT_TIMEOUT);
}

#[tokio::test]
async fn close_all_takes_down_established_connections() {
    let (server, port) = start_server(local_config(), AcceptAll).await;

    let first = connect(port, ConnectionConfig::default(), None).await.unwrap();
    let second = connect(port, ConnectionConfig::default(), None).await.unwrap();
    eventually("both connections in the table", || server.connection_count() == 2).await;

    server.close_all().await;
    assert_eq!(server.connection_count(), 0);
    eventually("both clients to notice", || !first.is_open() && !second.is_open()).await;
    server.stop().await;
}
