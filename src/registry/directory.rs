//! The process-wide... well, harness-wide, mapping from subsystem name to
//! [Registry].
//!
//! A [RegistryDirectory] is explicit state owned by a [crate::harness::Harness]
//! and handed to every driver it builds, rather than a lazily-initialised
//! global singleton: this is what lets two drivers created by the same
//! harness share one vocabulary of states for a subsystem name (e.g. both
//! see the same `"Pipe::reader"` registry), while two harnesses in the same
//! process stay isolated from one another.

use super::{Registry, State};
use crate::err::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Maps subsystem names to their [Registry], creating registries lazily on
/// first use.
#[derive(Debug, Default)]
pub struct RegistryDirectory {
    registries: Mutex<HashMap<String, Registry>>,
}

impl RegistryDirectory {
    /// Creates a new, empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry for `subsystem`, creating it if this is the
    /// first time that subsystem name has been seen.
    pub fn registry(&self, subsystem: &str) -> Result<Registry> {
        let mut registries = self.registries.lock()?;
        if let Some(existing) = registries.get(subsystem) {
            return Ok(existing.clone());
        }
        let created = Registry::new(subsystem);
        registries.insert(subsystem.to_owned(), created.clone());
        Ok(created)
    }

    /// Looks up a state by subsystem name and id, returning `None` if the
    /// subsystem or the id within it is unknown.
    #[must_use]
    pub fn lookup_state(&self, subsystem: &str, id: u32) -> Option<Arc<State>> {
        let registries = self.registries.lock().ok()?;
        registries.get(subsystem)?.lookup_state(id)
    }

    /// Looks up a state by subsystem name and state name, returning `None`
    /// if the subsystem or the name within it is unknown.
    #[must_use]
    pub fn lookup_by_name(&self, subsystem: &str, name: &str) -> Option<Arc<State>> {
        let registries = self.registries.lock().ok()?;
        registries.get(subsystem)?.lookup_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_subsystem_returns_same_registry() {
        let dir = RegistryDirectory::new();
        let a = dir.registry("Pipe::reader").unwrap();
        a.create_state("create", None).unwrap();
        let b = dir.registry("Pipe::reader").unwrap();
        assert_eq!(0, b.lookup_id("create").unwrap());
    }

    #[test]
    fn distinct_subsystems_are_isolated() {
        let dir = RegistryDirectory::new();
        let a = dir.registry("MessengerDriver").unwrap();
        let b = dir.registry("Pipe::reader").unwrap();
        a.create_state("message_received", None).unwrap();
        assert!(b.lookup_id("message_received").is_err());
    }

    #[test]
    fn lookup_through_directory_matches_registry() {
        let dir = RegistryDirectory::new();
        let r = dir.registry("Pipe::reader").unwrap();
        let id = r.create_state("accept::open", None).unwrap();
        assert_eq!(
            id,
            dir.lookup_by_name("Pipe::reader", "accept::open")
                .unwrap()
                .id()
        );
        assert_eq!(
            "accept::open",
            dir.lookup_state("Pipe::reader", id).unwrap().name()
        );
    }

    #[test]
    fn unknown_subsystem_is_none() {
        let dir = RegistryDirectory::new();
        assert!(dir.lookup_state("nope", 0).is_none());
        assert!(dir.lookup_by_name("nope", "nope").is_none());
    }
}
