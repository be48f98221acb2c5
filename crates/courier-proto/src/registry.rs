//! Message type registration and lookup.
//!
//! Applications declare their message types in a [`MessageSet`] and
//! hand it to the endpoint, which folds it into its [`Registry`]. The
//! receiver resolves every inbound tag through the registry to obtain a
//! fresh instance it can decode into.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::ProtocolError;
use crate::message::Behavior;

type Constructor = fn() -> Box<dyn Behavior>;

fn construct<M: Behavior + Default>() -> Box<dyn Behavior> {
    Box::new(M::default())
}

/// A named bundle of message types an application registers as a unit.
pub struct MessageSet {
    name: &'static str,
    entries: Vec<(&'static str, Constructor)>,
}

impl MessageSet {
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: Vec::new() }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds a message type to the set. The tag is taken from a default
    /// instance, so `type_id` must not depend on message state.
    pub fn insert<M: Behavior + Default>(mut self) -> Self {
        let tag = M::default().type_id();
        self.entries.push((tag, construct::<M>));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for MessageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSet")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Tag-to-constructor table shared by a connection's receiver.
pub struct Registry {
    table: RwLock<HashMap<&'static str, Constructor>>,
}

impl Registry {
    /// Creates a registry holding only the built-in system messages.
    pub fn new() -> Self {
        let registry = Self { table: RwLock::new(HashMap::new()) };
        registry.extend(&crate::system::message_set());
        registry
    }

    /// Folds a message set into the table and returns how many entries
    /// were loaded. A tag repeated within the set is skipped; a tag
    /// already present from an earlier set is replaced, so later sets
    /// win.
    pub fn extend(&self, set: &MessageSet) -> usize {
        let mut table = match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut seen: HashSet<&'static str> = HashSet::new();
        let mut loaded = 0;
        for (tag, constructor) in &set.entries {
            if !seen.insert(tag) {
                tracing::warn!(set = set.name, tag, "duplicate type id in set, skipped");
                continue;
            }
            if table.insert(tag, *constructor).is_some() {
                tracing::debug!(set = set.name, tag, "message type replaced");
            }
            loaded += 1;
        }
        tracing::debug!(set = set.name, loaded, "message set registered");
        loaded
    }

    /// Builds a fresh instance for an inbound tag.
    pub fn resolve(&self, tag: &str) -> Result<Box<dyn Behavior>, ProtocolError> {
        let table = match self.table.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match table.get(tag) {
            Some(constructor) => Ok(constructor()),
            None => Err(ProtocolError::UnknownType(tag.to_string())),
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        match self.table.read() {
            Ok(guard) => guard.contains_key(tag),
            Err(poisoned) => poisoned.into_inner().contains_key(tag),
        }
    }

    pub fn len(&self) -> usize {
        match self.table.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("types", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, SessionContext};
    use crate::system;
    use crate::wire::{WireReader, WireWriter};

    #[derive(Default)]
    struct Probe {
        value: u32,
    }

    impl Envelope for Probe {
        fn type_id(&self) -> &'static str {
            "test.probe"
        }

        fn encode(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
            w.write_u32(self.value);
            Ok(())
        }

        fn decode(&mut self, r: &mut WireReader<'_>) -> Result<(), ProtocolError> {
            self.value = r.read_u32()?;
            Ok(())
        }
    }

    impl Behavior for Probe {
        fn apply(&self, _ctx: &SessionContext) {}
    }

    #[test]
    fn new_registry_holds_system_messages() {
        let registry = Registry::new();
        assert!(registry.contains(system::END_OF_CONNECTION));
        assert!(registry.contains(system::PING));
        assert!(registry.contains(system::REGISTER));
        assert!(registry.contains(system::WELCOME));
        assert!(registry.contains(system::REFUSAL));
    }

    #[test]
    fn extend_loads_and_resolve_constructs() {
        let registry = Registry::new();
        let loaded = registry.extend(&MessageSet::new("test").insert::<Probe>());
        assert_eq!(loaded, 1);

        let instance = registry.resolve("test.probe").unwrap();
        assert_eq!(instance.type_id(), "test.probe");
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.resolve("nope.nothing"),
            Err(ProtocolError::UnknownType(tag)) if tag == "nope.nothing"
        ));
    }

    #[test]
    fn duplicate_within_one_set_is_skipped() {
        let registry = Registry::new();
        let loaded = registry.extend(&MessageSet::new("test").insert::<Probe>().insert::<Probe>());
        assert_eq!(loaded, 1);
    }

    #[test]
    fn duplicate_tag_replaces_earlier_entry() {
        let registry = Registry::new();
        registry.extend(&MessageSet::new("first").insert::<Probe>());
        let before = registry.len();
        registry.extend(&MessageSet::new("second").insert::<Probe>());
        assert_eq!(registry.len(), before);
    }
}
