//! States: named points of interest inside a subsystem's registry.

use super::Registry;
use std::sync::Weak;

/// An immutable record identifying one point of interest inside some
/// subsystem's execution.
///
/// States form a forest within their registry: each state may have a
/// superstate, and may be the superstate of others. Rather than holding
/// owning links in both directions (which would make the forest a cycle of
/// `Arc`s), a `State` keeps only its own id, name, and optional superstate
/// id, plus a weak handle back to the registry that owns it; substates are
/// recovered by asking the registry, not by walking an owned collection.
#[derive(Debug)]
pub struct State {
    pub(super) id: u32,
    pub(super) name: String,
    pub(super) registry: Weak<super::Inner>,
    pub(super) superstate: Option<u32>,
}

impl State {
    /// The id of this state, stable and unique within its registry.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The name of this state, unique within its registry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the subsystem this state's registry belongs to, if the
    /// registry is still alive.
    #[must_use]
    pub fn subsystem(&self) -> Option<String> {
        self.registry.upgrade().map(|inner| inner.name.clone())
    }

    /// The registry this state belongs to, if it is still alive.
    #[must_use]
    pub fn registry(&self) -> Option<Registry> {
        self.registry.upgrade().map(Registry)
    }

    /// This state's superstate, if it has one and the registry is still
    /// alive.
    #[must_use]
    pub fn superstate(&self) -> Option<std::sync::Arc<State>> {
        let id = self.superstate?;
        self.registry().and_then(|r| r.lookup_state(id))
    }

    /// All states directly below this one in the forest, in id order.
    #[must_use]
    pub fn substates(&self) -> Vec<std::sync::Arc<State>> {
        self.registry()
            .map(|r| r.substates_of(self.id))
            .unwrap_or_default()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.registry.ptr_eq(&other.registry)
    }
}

impl Eq for State {}
