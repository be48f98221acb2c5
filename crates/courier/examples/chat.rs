//! Minimal chat exchange over a local server.
//!
//! Run with: `cargo run --example chat`

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use courier::proto::{ProtocolError, WireReader, WireWriter};
use courier::{
    AccessDecider, Behavior, BindTarget, Connector, ConnectionConfig, Envelope, MessageSet,
    Registration, ServerConfig, SessionContext, Server, Verdict,
};

#[derive(Debug, Default, Clone)]
struct Say {
    from: String,
    text: String,
}

impl Envelope for Say {
    fn type_id(&self) -> &'static str {
        "chat.say"
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_string(&self.from)?;
        w.write_string(&self.text)
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.from = r.read_string()?;
        self.text = r.read_string()?;
        Ok(())
    }
}

impl Behavior for Say {
    fn apply(&self, ctx: &SessionContext) {
        if let Some(room) = ctx.downcast_ref::<Room>() {
            println!("[{}] {}: {}", room.name, self.from, self.text);
        }
    }
}

struct Room {
    name: &'static str,
}

fn chat_set() -> MessageSet {
    MessageSet::new("chat").insert::<Say>()
}

struct OpenDoor;

impl AccessDecider for OpenDoor {
    fn decide(
        &self,
        credential: &str,
        registration: Registration,
    ) -> impl Future<Output = Verdict> + Send {
        tracing::info!(credential, "guest at the door");
        async move {
            registration
                .accept(Some(Arc::new(Room { name: "lobby" }) as Arc<SessionContext>))
                .await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::new(BindTarget::Addr(Ipv4Addr::LOCALHOST.into()), 0);
    let server = Server::new(config, OpenDoor);
    server.register_messages(&chat_set());
    server.start();

    let mut port = None;
    for _ in 0..100 {
        if let Some(addr) = server.local_addr() {
            port = Some(addr.port());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let port = port.expect("server never bound");

    let connector = Connector::new(ConnectionConfig::default());
    let conn = connector
        .connect(
            "127.0.0.1",
            port,
            "guest",
            Some(Arc::new(Room { name: "client" }) as Arc<SessionContext>),
            &[chat_set()],
            Duration::from_secs(5),
        )
        .await
        .expect("connect failed");

    conn.send(Say { from: "alice".into(), text: "anyone here?".into() });
    conn.flush().await.expect("flush failed");
    tokio::time::sleep(Duration::from_millis(200)).await;

    server.broadcast(Say { from: "server".into(), text: "welcome to the lobby".into() });
    tokio::time::sleep(Duration::from_millis(200)).await;

    conn.close().await;
    server.stop().await;
}
