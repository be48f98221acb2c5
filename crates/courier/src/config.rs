//! Endpoint configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;

/// How the outbound half of a connection pushes queued envelopes onto
/// the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendMode {
    /// Write as soon as anything is queued.
    Immediate,
    /// Aggregate for up to `window` or until `limit` envelopes are
    /// queued, whichever comes first. A flush closes the window early.
    Timed { window: Duration, limit: usize },
    /// Write only when the application flushes.
    UserFlush,
}

impl SendMode {
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(20);
    pub const DEFAULT_BATCH: usize = 10;

    /// Timed aggregation with the stock window and batch size.
    pub fn timed() -> Self {
        SendMode::Timed { window: Self::DEFAULT_WINDOW, limit: Self::DEFAULT_BATCH }
    }
}

/// How the inbound half of a connection hands envelopes to behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecvMode {
    /// A background task dispatches envelopes as they arrive.
    Async,
    /// Nothing is dispatched until the application drains, and a single
    /// drain dispatches at most `max_per_drain` envelopes.
    Sync { max_per_drain: usize },
}

impl RecvMode {
    pub const DEFAULT_DRAIN: usize = 15;

    /// Synchronous dispatch with the stock drain ceiling.
    pub fn sync() -> Self {
        RecvMode::Sync { max_per_drain: Self::DEFAULT_DRAIN }
    }
}

/// Per-connection tuning, shared by both endpoint roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub send_mode: SendMode,
    pub recv_mode: RecvMode,
    /// Initial outbound queue soft limit. The queue grows past it
    /// rather than dropping or blocking.
    pub send_queue_limit: usize,
    /// Pacing between latency probes when a ping listener is attached.
    pub ping_interval: Duration,
    /// Extra wait for a late echo before a probe counts as failed.
    pub ping_grace: Duration,
    /// Safety ceiling on how long a flush may wait for the writer.
    pub flush_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_mode: SendMode::Immediate,
            recv_mode: RecvMode::Async,
            send_queue_limit: 25,
            ping_interval: Duration::from_secs(2),
            ping_grace: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(15),
        }
    }
}

/// Which local endpoint a server binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindTarget {
    /// A fixed address.
    Addr(IpAddr),
    /// A host name resolved at bind time; `index` picks among its
    /// addresses. Re-resolved periodically so a server follows an
    /// endpoint whose address changes.
    Named { host: String, index: usize },
}

impl BindTarget {
    pub(crate) async fn resolve(&self, port: u16) -> std::io::Result<SocketAddr> {
        match self {
            BindTarget::Addr(ip) => Ok(SocketAddr::new(*ip, port)),
            BindTarget::Named { host, index } => {
                let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), port)).await?.collect();
                addrs.get(*index).copied().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        format!("`{host}` has {} addresses, wanted index {index}", addrs.len()),
                    )
                })
            }
        }
    }

    /// Label for operator-facing diagnostics.
    pub fn describe(&self) -> String {
        match self {
            BindTarget::Addr(ip) => ip.to_string(),
            BindTarget::Named { host, index } => format!("{host}#{index}"),
        }
    }
}

/// Server acceptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub target: BindTarget,
    pub port: u16,
    /// Capacity of the connection table. Connections past it are
    /// refused with `codes::MAX_CONNECTIONS`.
    pub max_connections: usize,
    /// How long a blocked accept waits before the endpoint is
    /// re-checked.
    pub accept_timeout: Duration,
    /// Pause between bind retries while the endpoint is unavailable.
    pub rebind_period: Duration,
    /// How long an accepted socket may take to present its credential.
    pub handshake_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    pub fn new(target: BindTarget, port: u16) -> Self {
        Self {
            target,
            port,
            max_connections: 200,
            accept_timeout: Duration::from_secs(5),
            rebind_period: Duration::from_secs(180),
            handshake_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_tuning() {
        let config = ConnectionConfig::default();
        assert_eq!(config.send_mode, SendMode::Immediate);
        assert_eq!(config.recv_mode, RecvMode::Async);
        assert_eq!(config.ping_interval, Duration::from_secs(2));
        assert_eq!(config.flush_timeout, Duration::from_secs(15));

        assert_eq!(
            SendMode::timed(),
            SendMode::Timed { window: Duration::from_millis(20), limit: 10 }
        );
        assert_eq!(RecvMode::sync(), RecvMode::Sync { max_per_drain: 15 });
    }

    #[test]
    fn config_survives_serialization() {
        let config = ServerConfig::new(BindTarget::Named { host: "game.example".into(), index: 1 }, 26500);
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.target, config.target);
        assert_eq!(back.port, 26500);
    }

    #[tokio::test]
    async fn fixed_target_resolves_without_lookup() {
        let target = BindTarget::Addr("127.0.0.1".parse().unwrap());
        let addr = target.resolve(4000).await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[tokio::test]
    async fn named_target_rejects_out_of_range_index() {
        let target = BindTarget::Named { host: "localhost".into(), index: 64 };
        let err = target.resolve(4000).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrNotAvailable);
    }
}
