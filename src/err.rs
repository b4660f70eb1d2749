//! The crate-wide error type.
//!
//! Every fallible operation in the harness returns into this type, aliased
//! as [Result]. Nothing inside the crate logs-and-swallows an error.

use thiserror::Error;

/// A fixed sentinel returned by `pre_fail`/`post_fail` on an injected
/// failure. `inject_break` does not let a test choose its own code (see
/// `DESIGN.md`), so this is the one non-zero value the core ever hands back.
pub const INJECTED_ERROR: i32 = -1;

/// The harness's error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A state name collision in a registry.
    #[error("state {0:?} already exists in this registry")]
    AlreadyExists(String),

    /// An unknown state id, state name, connection, or instance.
    #[error("not found: {0}")]
    NotFound(String),

    /// An id supplied to `create_state_with_id` regressed behind the
    /// registry's allocation cursor.
    #[error("id {given} is behind the allocation cursor ({cursor})")]
    InvalidArgument {
        /// The id the caller supplied.
        given: u32,
        /// The registry's current allocation cursor.
        cursor: u32,
    },

    /// An order was issued against a driver not in the required lifecycle
    /// state.
    #[error("invalid driver state: expected {expected}, was {actual}")]
    InvalidState {
        /// The state the order required.
        expected: &'static str,
        /// The state the driver was actually in.
        actual: &'static str,
    },

    /// `break_connection` (or a send requiring one) found no live
    /// connection to the given destination.
    #[error("no connection to {0}")]
    NotConnected(String),

    /// `pre_fail`/`post_fail` returned a non-zero injected failure code.
    #[error("injected failure ({0})")]
    Injected(i32),

    /// A mutex guarding harness state was poisoned by a panicking holder.
    #[error("a lock was poisoned")]
    Poisoned,

    /// An error surfaced unchanged from the concrete transport.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The user supplied an unrecognised verbosity name.
    #[error("unsupported verbosity: {0}")]
    BadVerbosity(String),

    /// A [Config][crate::config::Config] failed to deserialise from TOML.
    #[error("couldn't parse config: {0}")]
    Deserialize(#[from] toml::de::Error),

    /// A [Config][crate::config::Config] failed to serialise to TOML.
    #[error("couldn't dump config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// `Result`s over [Error].
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}
