use courier_proto::{codes, ProtocolError};
use thiserror::Error;

/// Errors surfaced by connections, the server acceptor, and the client
/// connector.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer answered a connect attempt with a refusal frame.
    #[error("refused by peer (code {code}): {message}")]
    Refused { code: u16, message: String },

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The connect attempt was canceled locally.
    #[error("connect attempt canceled")]
    Canceled,

    /// A flush did not complete within the configured safety window.
    #[error("flush did not complete in time")]
    FlushTimeout,

    /// The connection is closed or closing.
    #[error("connection is closed")]
    Closed,

    /// Ping echo mode and a ping listener cannot coexist on one
    /// connection: the echoed probe would feed the local monitor.
    #[error("ping echo mode conflicts with an attached ping listener")]
    PingConflict,
}

impl TransportError {
    /// Numeric code for connect failures, mirroring the codes a refusal
    /// frame carries on the wire.
    pub fn connect_code(&self) -> u16 {
        match self {
            TransportError::Refused { code, .. } => *code,
            TransportError::Canceled => codes::CONNECT_CANCELED,
            TransportError::Timeout(_) => codes::CONNECT_TIMEOUT,
            _ => codes::CONNECT_FAILED,
        }
    }
}
