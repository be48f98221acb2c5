//! Built-in system messages.
//!
//! Tags under `sys.` are reserved. Two of them never reach the registry
//! dispatch path: the receiver intercepts [`END_OF_CONNECTION`] and
//! [`PING`] frames itself. The handshake trio ([`REGISTER`],
//! [`WELCOME`], [`REFUSAL`]) travels through normal dispatch; the
//! verdict messages resolve a [`ConnectGate`] installed as the session
//! context during a connect attempt.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::ProtocolError;
use crate::message::{Behavior, Envelope, SessionContext};
use crate::registry::MessageSet;
use crate::wire::{WireReader, WireWriter};

pub const END_OF_CONNECTION: &str = "sys.bye";
pub const PING: &str = "sys.ping";
pub const REGISTER: &str = "sys.register";
pub const WELCOME: &str = "sys.welcome";
pub const REFUSAL: &str = "sys.refusal";

/// The message set every registry starts from.
pub fn message_set() -> MessageSet {
    MessageSet::new("sys")
        .insert::<EndOfConnection>()
        .insert::<Ping>()
        .insert::<Register>()
        .insert::<Welcome>()
        .insert::<Refusal>()
}

/// Close sentinel. Queued last by an orderly close so the peer learns
/// the connection is ending before the socket drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndOfConnection;

impl Envelope for EndOfConnection {
    fn type_id(&self) -> &'static str {
        END_OF_CONNECTION
    }

    fn encode(&self, _w: &mut WireWriter) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode(&mut self, _r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl Behavior for EndOfConnection {
    fn apply(&self, _ctx: &SessionContext) {
        // Intercepted by the receiver; never dispatched.
    }
}

/// Latency probe. The sequence number cycles modulo 120 so a late echo
/// cannot be mistaken for the answer to a newer probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ping {
    pub sequence: u8,
}

impl Envelope for Ping {
    fn type_id(&self) -> &'static str {
        PING
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u8(self.sequence);
        Ok(())
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.sequence = r.read_u8()?;
        Ok(())
    }
}

impl Behavior for Ping {
    fn apply(&self, _ctx: &SessionContext) {
        // Intercepted by the receiver; never dispatched.
    }
}

/// First envelope a client sends: its credential for the access check.
#[derive(Debug, Default, Clone)]
pub struct Register {
    pub credential: String,
}

impl Envelope for Register {
    fn type_id(&self) -> &'static str {
        REGISTER
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_string(&self.credential)
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.credential = r.read_string()?;
        Ok(())
    }
}

impl Behavior for Register {
    fn apply(&self, _ctx: &SessionContext) {
        // The server reads the registration frame directly during the
        // handshake, before normal dispatch starts.
    }
}

/// Positive verdict on a connect attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct Welcome;

impl Envelope for Welcome {
    fn type_id(&self) -> &'static str {
        WELCOME
    }

    fn encode(&self, _w: &mut WireWriter) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode(&mut self, _r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl Behavior for Welcome {
    fn apply(&self, ctx: &SessionContext) {
        match ctx.downcast_ref::<ConnectGate>() {
            Some(gate) => gate.pass(),
            None => tracing::debug!("welcome received outside of a connect attempt"),
        }
    }
}

/// Negative verdict on a connect attempt, with a code from
/// [`crate::error::codes`] and a human-readable reason.
#[derive(Debug, Default, Clone)]
pub struct Refusal {
    pub code: u16,
    pub message: String,
}

impl Envelope for Refusal {
    fn type_id(&self) -> &'static str {
        REFUSAL
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.write_u16(self.code);
        w.write_string(&self.message)
    }

    fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.code = r.read_u16()?;
        self.message = r.read_string()?;
        Ok(())
    }
}

impl Behavior for Refusal {
    fn apply(&self, ctx: &SessionContext) {
        match ctx.downcast_ref::<ConnectGate>() {
            Some(gate) => gate.fail(self.code, &self.message),
            None => tracing::debug!(code = self.code, "refusal received outside of a connect attempt"),
        }
    }
}

/// One-shot verdict slot a connect attempt installs as session context
/// while it waits for the server's answer.
#[derive(Debug, Default)]
pub struct ConnectGate {
    verdict: Mutex<Option<Result<(), (u16, String)>>>,
    notify: Notify,
}

impl ConnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pass(&self) {
        self.settle(Ok(()));
    }

    pub fn fail(&self, code: u16, message: &str) {
        self.settle(Err((code, message.to_string())));
    }

    fn settle(&self, outcome: Result<(), (u16, String)>) {
        let mut slot = match self.verdict.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // First verdict wins.
        if slot.is_none() {
            *slot = Some(outcome);
            self.notify.notify_one();
        }
    }

    pub fn verdict(&self) -> Option<Result<(), (u16, String)>> {
        match self.verdict.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Waits until a verdict lands. Callers bound this with a timeout.
    pub async fn wait(&self) -> Result<(), (u16, String)> {
        loop {
            if let Some(verdict) = self.verdict() {
                return verdict;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn round_trip<M: Behavior + Default>(original: &M) -> M {
        let mut w = WireWriter::new();
        original.encode(&mut w).unwrap();
        let bytes = w.into_bytes();
        let mut decoded = M::default();
        let mut r = WireReader::new(&bytes);
        decoded.decode(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        decoded
    }

    #[test]
    fn ping_carries_its_sequence() {
        let decoded = round_trip(&Ping { sequence: 119 });
        assert_eq!(decoded.sequence, 119);
    }

    #[test]
    fn register_carries_its_credential() {
        let decoded = round_trip(&Register { credential: "guest:swordplay".into() });
        assert_eq!(decoded.credential, "guest:swordplay");
    }

    #[test]
    fn refusal_carries_code_and_reason() {
        let decoded = round_trip(&Refusal { code: 2, message: "server locked".into() });
        assert_eq!(decoded.code, 2);
        assert_eq!(decoded.message, "server locked");
    }

    #[tokio::test]
    async fn welcome_resolves_a_connect_gate() {
        let gate = Arc::new(ConnectGate::new());
        let ctx: Arc<SessionContext> = gate.clone();
        Welcome.apply(&*ctx);
        assert_eq!(gate.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn refusal_resolves_a_connect_gate_and_first_verdict_wins() {
        let gate = Arc::new(ConnectGate::new());
        let ctx: Arc<SessionContext> = gate.clone();
        Refusal { code: 1, message: "full".into() }.apply(&*ctx);
        Welcome.apply(&*ctx);
        assert_eq!(gate.wait().await, Err((1, "full".into())));
    }

    #[tokio::test]
    async fn gate_wait_wakes_on_late_verdict() {
        let gate = Arc::new(ConnectGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::task::yield_now().await;
        gate.pass();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }
}
