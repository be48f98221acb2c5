use thiserror::Error;

/// Errors raised while encoding or decoding frames, or resolving
/// message types against a [`Registry`](crate::registry::Registry).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The buffered bytes do not yet contain a complete frame. The
    /// caller should read more from the socket and retry.
    #[error("frame requires more bytes than are buffered")]
    Incomplete,

    /// A frame carried a type identifier no registered message matches.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// A frame of a known type could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A message could not be encoded into a frame.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Numeric codes carried by refusal frames and surfaced through
/// connect errors.
pub mod codes {
    /// The server connection table is full.
    pub const MAX_CONNECTIONS: u16 = 1;

    /// The server is up but not currently admitting new connections.
    pub const ACCESS_LOCKED: u16 = 2;

    /// The presented credential was rejected.
    pub const BAD_CREDENTIAL: u16 = 3;

    /// The connect attempt failed before a verdict arrived.
    pub const CONNECT_FAILED: u16 = 100;

    /// The connect attempt was canceled locally.
    pub const CONNECT_CANCELED: u16 = 101;

    /// The connect attempt ran past its deadline.
    pub const CONNECT_TIMEOUT: u16 = 102;
}
