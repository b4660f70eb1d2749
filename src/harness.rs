//! The top-level harness: owns every driver, the address index, and the
//! registry directory they all share.

use crate::alert::StateAlert;
use crate::driver::{DriverState, InstanceId, MessengerDriver, TransportFactory};
use crate::err::{Error, Result};
use crate::registry::{RegistryDirectory, State};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct DriverSet {
    by_instance: HashMap<InstanceId, Arc<MessengerDriver>>,
    by_address: HashMap<String, InstanceId>,
    next_instance: InstanceId,
}

/// Creates drivers, wires them together, and vends alert factories and
/// state lookups to test code. Owns the [RegistryDirectory] every driver it
/// builds shares, so two drivers created by the same harness see the same
/// vocabulary of states for a given subsystem name.
pub struct Harness {
    registries: Arc<RegistryDirectory>,
    factory: Arc<TransportFactory>,
    drivers: Mutex<DriverSet>,
}

impl Harness {
    /// Creates an empty harness. `factory` is called once per
    /// [Self::create_messenger], and is the seam at which a concrete
    /// transport implementation plugs into the harness.
    #[must_use]
    pub fn new(factory: Arc<TransportFactory>) -> Self {
        Self {
            registries: Arc::new(RegistryDirectory::new()),
            factory,
            drivers: Mutex::new(DriverSet::default()),
        }
    }

    /// Allocates a fresh transport bound to `address`, wraps it in a driver,
    /// starts it, and records it. Errors with [Error::AlreadyExists] if
    /// `address` is already in use by a live driver in this harness.
    pub fn create_messenger(&self, address: impl Into<String>) -> Result<Arc<MessengerDriver>> {
        let address = address.into();
        let mut drivers = self.drivers.lock()?;
        if drivers.by_address.contains_key(&address) {
            return Err(Error::AlreadyExists(address));
        }
        let instance = drivers.next_instance;
        let driver = Arc::new(MessengerDriver::new(
            instance,
            address.clone(),
            self.registries.clone(),
            &*self.factory,
        )?);
        driver.init()?;
        drivers.next_instance += 1;
        drivers.by_instance.insert(instance, driver.clone());
        drivers.by_address.insert(address, instance);
        Ok(driver)
    }

    /// Removes `driver` from this harness's indices and stops it.
    pub fn shutdown_messenger(&self, driver: &Arc<MessengerDriver>) -> Result<()> {
        let mut drivers = self.drivers.lock()?;
        drivers.by_instance.remove(&driver.instance());
        drivers.by_address.retain(|_, inst| *inst != driver.instance());
        drop(drivers);
        driver.stop()
    }

    /// Instructs `origin` to establish a connection to `dest`.
    pub fn connect_messengers(
        &self,
        origin: &MessengerDriver,
        dest: &MessengerDriver,
    ) -> Result<()> {
        origin.establish_connection(dest.instance())
    }

    /// Creates a fresh, unreached alert watching `state`, with its own
    /// internal mutex/condvar pair.
    #[must_use]
    pub fn generate_alert(&self, state: Arc<State>) -> StateAlert {
        StateAlert::new(state)
    }

    /// As [Self::generate_alert], but the alert additionally notifies the
    /// given external `lock`/`cond` pair whenever it reaches or is
    /// released, so a test can block on several distinct alerts through one
    /// shared condition.
    #[must_use]
    pub fn generate_alert_with_condition(
        &self,
        state: Arc<State>,
        lock: Arc<Mutex<()>>,
        cond: Arc<Condvar>,
    ) -> StateAlert {
        StateAlert::with_condition(state, lock, cond)
    }

    /// Looks up a state by subsystem name and state name.
    #[must_use]
    pub fn lookup_state(&self, subsystem: &str, name: &str) -> Option<Arc<State>> {
        self.registries.lookup_by_name(subsystem, name)
    }

    /// Looks up a state by subsystem name and id.
    #[must_use]
    pub fn lookup_state_by_id(&self, subsystem: &str, id: u32) -> Option<Arc<State>> {
        self.registries.lookup_state(subsystem, id)
    }

    /// Looks up a live driver by the address it was created with.
    #[must_use]
    pub fn driver_at(&self, address: &str) -> Option<Arc<MessengerDriver>> {
        let drivers = self.drivers.lock().ok()?;
        let instance = drivers.by_address.get(address)?;
        drivers.by_instance.get(instance).cloned()
    }

    /// Stops every remaining driver. Drivers already `Stopped` or `Failed`
    /// are skipped rather than treated as errors, since `clean_up` is a
    /// best-effort teardown, not an order a test asserts on.
    pub fn clean_up(&self) -> Result<()> {
        let drivers = self.drivers.lock()?;
        for driver in drivers.by_instance.values() {
            if driver.state()? == DriverState::Running {
                driver.stop()?;
            }
        }
        Ok(())
    }
}
