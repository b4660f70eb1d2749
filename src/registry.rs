//! The hierarchical state registry.
//!
//! A [Registry] is a namespaced, append-only bag of [State]s belonging to
//! one subsystem (e.g. `"MessengerDriver"`, `"Pipe::reader"`). A
//! [directory::RegistryDirectory] maps subsystem names to registries,
//! creating them lazily, so that any two drivers instrumenting the same
//! kind of subsystem share one vocabulary of states.

pub mod directory;
pub mod state;

pub use directory::RegistryDirectory;
pub use state::State;

use crate::err::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hidden shared state behind a [Registry] handle.
#[derive(Debug)]
pub struct Inner {
    name: String,
    data: Mutex<Data>,
}

#[derive(Debug, Default)]
struct Data {
    /// Indexed by id. `None` means "never allocated", which can happen in
    /// the gap left behind when `create_state_with_id` jumps the cursor
    /// forward.
    states: Vec<Option<Arc<State>>>,
    by_name: HashMap<String, u32>,
    next_id: u32,
}

/// A namespaced, append-only bag of states for one subsystem.
///
/// Cloning a `Registry` is cheap and shares the same underlying data; this
/// is how the same registry ends up visible from multiple drivers via the
/// [RegistryDirectory].
#[derive(Debug, Clone)]
pub struct Registry(Arc<Inner>);

impl Registry {
    /// Creates a new, empty registry for the named subsystem.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(Inner {
            name: name.into(),
            data: Mutex::new(Data::default()),
        }))
    }

    /// The subsystem name this registry was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Allocates the next id for `name`, linking it under `superstate` if
    /// one is given.
    ///
    /// # Errors
    ///
    /// Returns [Error::AlreadyExists] if `name` is already registered, or
    /// [Error::NotFound] if `superstate` names an id this registry has
    /// never allocated.
    pub fn create_state(&self, name: impl Into<String>, superstate: Option<u32>) -> Result<u32> {
        let name = name.into();
        let mut data = self.0.data.lock()?;
        Self::check_new_state(&data, &name, superstate)?;
        let id = data.next_id;
        data.next_id += 1;
        Self::allocate(&mut data, &self.0, id, name, superstate);
        Ok(id)
    }

    /// As [Self::create_state], but the caller dictates the id.
    ///
    /// # Errors
    ///
    /// As [Self::create_state], plus [Error::InvalidArgument] if `id` is
    /// behind this registry's allocation cursor (ids must move forward;
    /// there is no backfilling).
    pub fn create_state_with_id(
        &self,
        name: impl Into<String>,
        id: u32,
        superstate: Option<u32>,
    ) -> Result<u32> {
        let name = name.into();
        let mut data = self.0.data.lock()?;
        Self::check_new_state(&data, &name, superstate)?;
        if id < data.next_id {
            return Err(Error::InvalidArgument {
                given: id,
                cursor: data.next_id,
            });
        }
        data.next_id = id + 1;
        Self::allocate(&mut data, &self.0, id, name, superstate);
        Ok(id)
    }

    fn check_new_state(data: &Data, name: &str, superstate: Option<u32>) -> Result<()> {
        if data.by_name.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        if let Some(sup) = superstate {
            if !matches!(data.states.get(sup as usize), Some(Some(_))) {
                return Err(Error::NotFound(format!("superstate id {sup}")));
            }
        }
        Ok(())
    }

    fn allocate(data: &mut Data, inner: &Arc<Inner>, id: u32, name: String, superstate: Option<u32>) {
        let state = Arc::new(State {
            id,
            name: name.clone(),
            registry: Arc::downgrade(inner),
            superstate,
        });
        let idx = id as usize;
        if data.states.len() <= idx {
            data.states.resize_with(idx + 1, || None);
        }
        data.states[idx] = Some(state);
        data.by_name.insert(name, id);
    }

    /// Looks up a state by id. Returns `None` if `id` was never allocated.
    #[must_use]
    pub fn lookup_state(&self, id: u32) -> Option<Arc<State>> {
        let data = self.0.data.lock().ok()?;
        data.states.get(id as usize).cloned().flatten()
    }

    /// Looks up a state's id by name.
    ///
    /// # Errors
    ///
    /// Returns [Error::NotFound] if no state of that name has been
    /// registered.
    pub fn lookup_id(&self, name: &str) -> Result<u32> {
        let data = self.0.data.lock()?;
        data.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("state {name:?}")))
    }

    /// Looks up a state by name, as a convenience over
    /// [Self::lookup_id] + [Self::lookup_state].
    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<State>> {
        let id = self.lookup_id(name).ok()?;
        self.lookup_state(id)
    }

    /// Finds or creates a top-level state by name, used when a transport
    /// reports a state name this registry has not seen before.
    pub fn state_id_for_name(&self, name: &str) -> Result<u32> {
        match self.lookup_id(name) {
            Ok(id) => Ok(id),
            Err(Error::NotFound(_)) => self.create_state(name, None),
            Err(e) => Err(e),
        }
    }

    /// All states directly below `id`, in id order.
    #[must_use]
    pub fn substates_of(&self, id: u32) -> Vec<Arc<State>> {
        let Ok(data) = self.0.data.lock() else {
            return Vec::new();
        };
        data.states
            .iter()
            .flatten()
            .filter(|s| s.superstate == Some(id))
            .cloned()
            .collect()
    }

    /// The number of states currently allocated in this registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0
            .data
            .lock()
            .map(|d| d.states.iter().flatten().count())
            .unwrap_or(0)
    }

    /// Whether this registry has no states yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All states in this registry, in id order, for diagnostic dumps.
    #[must_use]
    pub fn states(&self) -> Vec<Arc<State>> {
        self.0
            .data
            .lock()
            .map(|d| d.states.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }
}
