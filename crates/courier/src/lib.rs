//! Point-to-point message transport.
//!
//! Applications define typed messages ([`Envelope`]/[`Behavior`]),
//! declare them in a [`MessageSet`], and exchange them over a
//! [`Connection`]. A [`Server`] accepts and vets inbound connections;
//! a [`Connector`] establishes outbound ones. Optional latency
//! monitoring runs over the same connection via [`PingListener`].

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod ping;
pub mod receiver;
pub mod sender;
pub mod server;

pub use courier_proto as proto;

pub use client::Connector;
pub use config::{BindTarget, ConnectionConfig, RecvMode, SendMode, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionListener, ConnectionState};
pub use error::TransportError;
pub use ping::{PingListener, PingReport};
pub use proto::{Behavior, Envelope, MessageSet, Registry, SessionContext, codes};
pub use server::{
    AcceptAll, AccessDecider, Registration, Server, ServerListener, ServerState, Verdict,
};
