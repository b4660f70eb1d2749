//! `MessengerDriver`: the per-transport façade, and the instrumentation
//! tracker and external `Transport`/`Hooks` interfaces it sits between.
//!
//! A driver owns one transport exclusively, plus the instrumentation and
//! fault tables that the transport's instrumentation points report into.
//! Test code issues *orders* against the driver (`send`, `establish_connection`,
//! `break_connection`, ...); the transport, running on its own threads,
//! calls back into the driver's [Hooks] implementation at transition points
//! and around interruptible calls.

use crate::alert::{Payload, StateAlert};
use crate::err::{Error, Result};
use crate::fault::FaultTable;
use crate::registry::{Registry, RegistryDirectory, State};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Opaque integer identifying one concrete occurrence of a subsystem inside
/// a transport (e.g. one accepted pipe, or a messenger itself). Not stable
/// across reconnects.
pub type InstanceId = u64;

/// A message handed to [MessengerDriver::send] or delivered via
/// [Hooks::message_received]. Opaque to the harness beyond its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(pub Vec<u8>);

impl Message {
    /// Wraps `bytes` as a message.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The message's bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A state, given by the transport to [Hooks::report_state], named or by id.
pub enum StateRef {
    /// An arbitrary, subsystem-namespaced name; auto-registered as a
    /// top-level state if unknown.
    Name(String),
    /// A previously-allocated id.
    Id(u32),
}

impl From<&str> for StateRef {
    fn from(s: &str) -> Self {
        Self::Name(s.to_owned())
    }
}

impl From<String> for StateRef {
    fn from(s: String) -> Self {
        Self::Name(s)
    }
}

impl From<u32> for StateRef {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

/// The driver's own native, instance-less events, fired by its dispatcher
/// callbacks rather than through `report_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NativeSlot {
    MessageReceived,
    LossyConnectionBroke,
    RemoteReset,
    NewIncomingConnection,
}

const NATIVE_SLOT_NAMES: [(&str, NativeSlot); 4] = [
    ("message_received", NativeSlot::MessageReceived),
    ("lossy_connection_broke", NativeSlot::LossyConnectionBroke),
    ("remote_reset", NativeSlot::RemoteReset),
    ("new_incoming_connection", NativeSlot::NewIncomingConnection),
];

/// The name of the driver's own registry, which holds the four native slots.
pub const DRIVER_SUBSYSTEM: &str = "MessengerDriver";

impl NativeSlot {
    fn from_name(name: &str) -> Option<Self> {
        NATIVE_SLOT_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, slot)| *slot)
    }
}

/// The hooks a `Transport` implementation calls into its driver through.
/// The driver hands a handle implementing this trait to the transport
/// factory at construction time, before the transport itself exists, which
/// is how a transport's own background threads get a way to call back in.
pub trait Hooks: Send + Sync {
    /// Reports that `(subsystem, instance)` has transitioned to `state`.
    /// Returns the state's id (auto-registering an unknown name as a
    /// top-level state in that subsystem's registry).
    fn report_state(&self, subsystem: &str, instance: InstanceId, state: StateRef) -> Result<u32>;

    /// Queried before an interruptible call; `0` means proceed, non-zero is
    /// an injected failure to surface as if the call itself had failed.
    fn pre_fail(&self, subsystem: &str, instance: InstanceId) -> Result<i32>;

    /// As [Self::pre_fail], queried after the call.
    fn post_fail(&self, subsystem: &str, instance: InstanceId) -> Result<i32>;

    /// Dispatches an incoming message from `from`.
    fn message_received(&self, msg: Message, from: InstanceId) -> Result<()>;

    /// Dispatches a lossy (unacknowledged) connection break.
    fn lossy_connection_broke(&self) -> Result<()>;

    /// Dispatches a peer-initiated reset.
    fn remote_reset(&self) -> Result<()>;
}

/// The transport interface the driver drives. A concrete network transport
/// is an external collaborator; this crate only specifies the hooks it must
/// call (via the [Hooks] handle given to the factory) and the orders it must
/// honor.
pub trait Transport: Send {
    /// Binds the transport to `addr`.
    fn bind(&mut self, addr: &str) -> Result<()>;
    /// Starts the transport's background work.
    fn start(&mut self) -> Result<()>;
    /// Hands `msg` to the transport for delivery to `dest`.
    fn send(&mut self, msg: Message, dest: InstanceId) -> Result<()>;
    /// Opens or obtains a connection to `dest`, non-blocking; returns the
    /// pipe instance id backing it.
    fn get_connection(&mut self, dest: InstanceId) -> Result<InstanceId>;
    /// Tears down the session-level connection to `dest`.
    fn mark_down(&mut self, dest: InstanceId) -> Result<()>;
    /// The pipe instance id currently backing a connection to `dest`, if
    /// one exists, without creating one.
    fn connection_instance(&self, dest: InstanceId) -> Option<InstanceId>;
    /// Begins shutting the transport down.
    fn shutdown(&mut self) -> Result<()>;
    /// Blocks until the transport has fully shut down.
    fn wait(&mut self) -> Result<()>;
}

/// Factory for a boxed `Transport`, given the address it should bind, the
/// instance id its owning driver was allocated, and a [Hooks] handle back
/// into that driver. The harness owns one of these per [crate::harness::Harness].
pub type TransportFactory =
    dyn Fn(&str, InstanceId, Arc<dyn Hooks>) -> Result<Box<dyn Transport>> + Send + Sync;

/// The driver's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Constructed, not yet started.
    Built,
    /// Started and accepting orders.
    Running,
    /// Cleanly shut down.
    Stopped,
    /// A lifecycle step failed; terminal, like `Stopped`.
    Failed,
}

impl DriverState {
    fn name(self) -> &'static str {
        match self {
            Self::Built => "Built",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Default)]
struct Tracker {
    /// Current state per (subsystem, instance).
    current: HashMap<(String, InstanceId), Arc<State>>,
    /// Alerts pending on a specific (subsystem, instance, state-id) transition.
    subsystem_alerts: HashMap<(String, InstanceId, u32), Vec<StateAlert>>,
    /// Alerts pending on a driver-native slot.
    native_alerts: HashMap<NativeSlot, Vec<StateAlert>>,
    fault: FaultTable,
}

/// State shared between a [MessengerDriver] and the [Hooks] handle its
/// transport was built with.
struct Shared {
    instance_id: InstanceId,
    address: String,
    registries: Arc<RegistryDirectory>,
    tracker: Mutex<Tracker>,
}

impl Shared {
    fn registry(&self, subsystem: &str) -> Result<Registry> {
        self.registries.registry(subsystem)
    }

    fn inject_break(&self, instance: InstanceId, count: u32, state: Option<u32>) -> Result<()> {
        let mut tracker = self.tracker.lock()?;
        tracker.fault.inject_break(instance, count, state);
        Ok(())
    }

    fn register_subsystem_alert(
        &self,
        alert: StateAlert,
        subsystem: &str,
        instance: InstanceId,
    ) -> Result<()> {
        let key = (subsystem.to_owned(), instance, alert.watched().id());
        let mut tracker = self.tracker.lock()?;
        tracker.subsystem_alerts.entry(key).or_default().push(alert);
        Ok(())
    }

    fn register_native_alert(&self, alert: StateAlert) -> Result<()> {
        let name = alert.watched().name().to_owned();
        let slot = NativeSlot::from_name(&name)
            .ok_or_else(|| Error::NotFound(format!("native slot {name:?}")))?;
        debug_assert_eq!(
            alert.watched().subsystem().as_deref(),
            Some(DRIVER_SUBSYSTEM),
            "native alert's watched state must belong to the {DRIVER_SUBSYSTEM} registry",
        );
        let mut tracker = self.tracker.lock()?;
        tracker.native_alerts.entry(slot).or_default().push(alert);
        Ok(())
    }

    fn fire_native(&self, slot: NativeSlot, payload: Option<Payload>) -> Result<()> {
        let pending = {
            let mut tracker = self.tracker.lock()?;
            tracker.native_alerts.remove(&slot).unwrap_or_default()
        };
        for alert in pending {
            alert.set_reached(payload.clone());
        }
        Ok(())
    }
}

impl Hooks for Shared {
    fn report_state(&self, subsystem: &str, instance: InstanceId, state: StateRef) -> Result<u32> {
        let registry = self.registry(subsystem)?;
        let id = match state {
            StateRef::Id(id) => id,
            StateRef::Name(name) => registry.state_id_for_name(&name)?,
        };
        let state_obj = registry
            .lookup_state(id)
            .ok_or_else(|| Error::NotFound(format!("state id {id} in {subsystem}")))?;
        let is_pipe_create = subsystem == "Pipe::reader" && state_obj.name() == "create";

        let mut pending = {
            let mut tracker = self.tracker.lock()?;
            tracker
                .current
                .insert((subsystem.to_owned(), instance), state_obj);
            tracker
                .subsystem_alerts
                .remove(&(subsystem.to_owned(), instance, id))
                .unwrap_or_default()
        };
        let payload: Payload = Arc::new(instance);
        if is_pipe_create {
            let native = {
                let mut tracker = self.tracker.lock()?;
                tracker
                    .native_alerts
                    .remove(&NativeSlot::NewIncomingConnection)
                    .unwrap_or_default()
            };
            for alert in native {
                alert.set_reached(Some(payload.clone()));
            }
        }
        for alert in pending.drain(..) {
            alert.set_reached(Some(payload.clone()));
        }
        Ok(id)
    }

    fn pre_fail(&self, subsystem: &str, instance: InstanceId) -> Result<i32> {
        let mut tracker = self.tracker.lock()?;
        let current = tracker
            .current
            .get(&(subsystem.to_owned(), instance))
            .map(|s| s.id());
        Ok(tracker.fault.consult(instance, current))
    }

    fn post_fail(&self, subsystem: &str, instance: InstanceId) -> Result<i32> {
        self.pre_fail(subsystem, instance)
    }

    fn message_received(&self, msg: Message, _from: InstanceId) -> Result<()> {
        self.fire_native(NativeSlot::MessageReceived, Some(Arc::new(msg)))
    }

    fn lossy_connection_broke(&self) -> Result<()> {
        self.fire_native(NativeSlot::LossyConnectionBroke, None)
    }

    fn remote_reset(&self) -> Result<()> {
        self.fire_native(NativeSlot::RemoteReset, None)
    }
}

/// Wraps one transport: implements the instrumentation tracker and fault
/// injector for it, and surfaces the orders test code drives it with.
pub struct MessengerDriver {
    transport: Mutex<Box<dyn Transport>>,
    shared: Arc<Shared>,
    state: Mutex<DriverState>,
}

impl MessengerDriver {
    pub(crate) fn new(
        instance: InstanceId,
        address: String,
        registries: Arc<RegistryDirectory>,
        factory: &TransportFactory,
    ) -> Result<Self> {
        Self::ensure_native_states(&registries.registry(DRIVER_SUBSYSTEM)?)?;
        let shared = Arc::new(Shared {
            instance_id: instance,
            address: address.clone(),
            registries,
            tracker: Mutex::new(Tracker::default()),
        });
        let hooks: Arc<dyn Hooks> = shared.clone();
        let transport = factory(&address, instance, hooks)?;
        Ok(Self {
            transport: Mutex::new(transport),
            shared,
            state: Mutex::new(DriverState::Built),
        })
    }

    fn ensure_native_states(registry: &Registry) -> Result<()> {
        for (id, (name, _)) in NATIVE_SLOT_NAMES.iter().enumerate() {
            match registry.create_state_with_id(*name, id as u32, None) {
                Ok(_) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The instance id the harness allocated this driver.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.shared.instance_id
    }

    /// The address this driver was bound to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// The driver's current lifecycle state.
    pub fn state(&self) -> Result<DriverState> {
        Ok(*self.state.lock()?)
    }

    fn require_state(&self, allowed: &[DriverState]) -> Result<DriverState> {
        let current = *self.state.lock()?;
        if allowed.contains(&current) {
            Ok(current)
        } else {
            Err(Error::InvalidState {
                expected: allowed.first().map_or("none", |s| s.name()),
                actual: current.name(),
            })
        }
    }

    /// Starts the transport. `Built -> Running` on success, `-> Failed` on
    /// error.
    pub fn init(&self) -> Result<()> {
        self.require_state(&[DriverState::Built])?;
        let result = {
            let mut t = self.transport.lock()?;
            t.bind(&self.shared.address).and_then(|()| t.start())
        };
        let mut state = self.state.lock()?;
        match result {
            Ok(()) => {
                *state = DriverState::Running;
                Ok(())
            }
            Err(e) => {
                *state = DriverState::Failed;
                Err(e)
            }
        }
    }

    /// Shuts the transport down. `Running -> Stopped` on success, `->
    /// Failed` on error. Errors with `InvalidState` if already `Stopped`,
    /// `Built`, or `Failed`.
    pub fn stop(&self) -> Result<()> {
        let current = *self.state.lock()?;
        if current != DriverState::Running {
            return Err(Error::InvalidState {
                expected: DriverState::Running.name(),
                actual: current.name(),
            });
        }
        let result = {
            let mut t = self.transport.lock()?;
            t.shutdown().and_then(|()| t.wait())
        };
        let mut state = self.state.lock()?;
        match result {
            Ok(()) => {
                *state = DriverState::Stopped;
                Ok(())
            }
            Err(e) => {
                *state = DriverState::Failed;
                Err(e)
            }
        }
    }

    /// Hands `msg` to the transport for delivery to `dest`.
    pub fn send(&self, msg: Message, dest: InstanceId) -> Result<()> {
        self.require_state(&[DriverState::Running])?;
        self.transport.lock()?.send(msg, dest)
    }

    /// Instructs the transport to open or obtain a connection to `dest`.
    pub fn establish_connection(&self, dest: InstanceId) -> Result<()> {
        self.require_state(&[DriverState::Running])?;
        self.transport.lock()?.get_connection(dest).map(|_| ())
    }

    /// Tears down the session-level connection to `dest`.
    pub fn break_connection(&self, dest: InstanceId) -> Result<()> {
        self.require_state(&[DriverState::Running])?;
        self.transport.lock()?.mark_down(dest)
    }

    /// Finds the pipe instance backing the connection to `dest` and injects
    /// `count` unconditional failures into it.
    pub fn break_socket(&self, dest: InstanceId, count: u32) -> Result<()> {
        self.require_state(&[DriverState::Running])?;
        let instance = {
            let t = self.transport.lock()?;
            t.connection_instance(dest)
                .ok_or_else(|| Error::NotFound(format!("connection to instance {dest}")))?
        };
        self.shared.inject_break(instance, count, None)
    }

    /// Injects `count` failures into `instance` when it is next in `state`.
    pub fn break_socket_in(&self, instance: InstanceId, count: u32, state: &State) -> Result<()> {
        self.require_state(&[DriverState::Running])?;
        self.shared.inject_break(instance, count, Some(state.id()))
    }

    /// Registers `alert` on one of the driver's own native slots. The
    /// alert's watched state must belong to the driver's own registry.
    pub fn register_alert(&self, alert: StateAlert) -> Result<()> {
        self.shared.register_native_alert(alert)
    }

    /// Registers `alert` to fire on `(subsystem, instance)`'s next
    /// transition into the alert's watched state.
    pub fn register_subsystem_alert(
        &self,
        alert: StateAlert,
        subsystem: &str,
        instance: InstanceId,
    ) -> Result<()> {
        self.shared
            .register_subsystem_alert(alert, subsystem, instance)
    }

    /// Returns (creating if absent) the registry for `subsystem`. Shared
    /// across every driver built by the same harness.
    pub fn subsystem_registry(&self, subsystem: &str) -> Result<Registry> {
        self.shared.registry(subsystem)
    }

    /// A snapshot of this driver's instrumentation table, for use by
    /// [crate::diag::driver_report].
    pub fn instrumentation_rows(&self) -> Result<Vec<crate::diag::InstrumentationRow>> {
        let tracker = self.shared.tracker.lock()?;
        let mut rows: Vec<_> = tracker
            .current
            .iter()
            .map(|((subsystem, instance), state)| {
                let pending_alerts = tracker
                    .subsystem_alerts
                    .get(&(subsystem.clone(), *instance, state.id()))
                    .map_or(0, Vec::len);
                crate::diag::InstrumentationRow {
                    subsystem: subsystem.clone(),
                    instance: *instance,
                    current_state: Some(state.name().to_owned()),
                    pending_alerts,
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.subsystem, a.instance).cmp(&(&b.subsystem, b.instance)));
        Ok(rows)
    }
}
