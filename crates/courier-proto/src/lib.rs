//! Protocol layer of the courier transport: the frame format, the
//! message traits, the type registry, and the built-in system messages.
//!
//! The transport crate (`courier`) builds connections, servers, and
//! clients on top of these pieces.

pub mod error;
pub mod message;
pub mod registry;
pub mod system;
pub mod wire;

pub use error::{codes, ProtocolError};
pub use message::{Behavior, Envelope, SessionContext};
pub use registry::{MessageSet, Registry};
pub use wire::{WireReader, WireWriter};
