//! Message traits.
//!
//! An [`Envelope`] knows its type tag and how to serialize itself. A
//! [`Behavior`] is an envelope that can also act on the receiving side:
//! the receiver resolves the incoming tag through the registry, decodes
//! a fresh instance, and invokes [`Behavior::apply`] with the
//! connection's session context.

use std::any::Any;

use crate::error::ProtocolError;
use crate::wire::{WireReader, WireWriter};

/// Application-defined state a connection dispatches inbound messages
/// against. Behaviors downcast it to the concrete type they expect.
pub type SessionContext = dyn Any + Send + Sync;

/// A unit of transfer: a typed, self-serializing message.
pub trait Envelope: Send + 'static {
    /// Stable dotted identifier, e.g. `"chat.say"`. Identifiers
    /// starting with `sys.` are reserved for the transport.
    fn type_id(&self) -> &'static str;

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError>;

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError>;
}

/// Receiving-side half of a message.
pub trait Behavior: Envelope {
    /// Runs the message against the session context. Called on the
    /// receiver's dispatch path, so it must not block.
    fn apply(&self, ctx: &SessionContext);
}
