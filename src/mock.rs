//! An in-memory, test-only `Transport`, used solely by this crate's own
//! test suite to drive the harness end to end (the concrete network
//! transport is out of scope for the harness itself). Addresses are
//! arbitrary strings; each instance runs one background thread that models
//! a reconnecting pipe reader: accepting a peer reports `Pipe::reader`
//! states `create`, `accept::open`, `accept::fail_unlocked`, and a pipe
//! that fails mid-flight is discarded and silently re-accepted on the next
//! delivery attempt, which is how a single injected socket break ends up
//! absorbed by reconnection.

#![cfg(test)]

use crate::driver::{Hooks, InstanceId, Message, StateRef, Transport};
use crate::err::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A network-wide directory every mock transport registers itself into, so
/// `send`/`get_connection` can find a peer by instance id without the
/// harness needing to know about the mock transport at all. Shared by every
/// transport [MockTransport::factory] builds for one harness.
#[derive(Default)]
struct Directory {
    by_instance: HashMap<InstanceId, Peer>,
}

#[derive(Clone)]
struct Peer {
    inbox: Sender<Envelope>,
}

enum Envelope {
    /// A peer wants to warm up (or re-warm) a connection to us, without
    /// necessarily having a message ready yet.
    Connect(InstanceId),
    /// A message from a peer.
    Deliver(Message, InstanceId),
    /// The peer at the given instance tore down its connection to us.
    Reset(InstanceId),
    Shutdown,
}

struct Connection {
    pipe_instance: Option<InstanceId>,
}

struct State {
    directory: Arc<Mutex<Directory>>,
    instance: InstanceId,
    hooks: Arc<dyn Hooks>,
    connections: Mutex<HashMap<InstanceId, Connection>>,
    next_pipe_instance: Mutex<InstanceId>,
    inbox_rx: Mutex<Option<Receiver<Envelope>>>,
    inbox_tx: Sender<Envelope>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Maximum pipe (re-)accept attempts a single delivery will make before
/// giving up. Bounds what would otherwise be unbounded retry under a
/// persistent wildcard break; no scenario this crate tests needs more than
/// two.
const MAX_ACCEPT_ATTEMPTS: u32 = 8;

/// An in-memory `Transport` for tests.
pub struct MockTransport(Arc<State>);

impl MockTransport {
    fn new(instance: InstanceId, hooks: Arc<dyn Hooks>, directory: Arc<Mutex<Directory>>) -> Self {
        let (tx, rx) = channel::unbounded();
        Self(Arc::new(State {
            directory,
            instance,
            hooks,
            connections: Mutex::new(HashMap::new()),
            next_pipe_instance: Mutex::new(instance * 1000),
            inbox_rx: Mutex::new(Some(rx)),
            inbox_tx: tx,
            worker: Mutex::new(None),
        }))
    }

    /// Builds a transport factory; every driver created against the
    /// returned factory for one harness shares one mock network.
    #[must_use]
    pub fn factory() -> Arc<crate::driver::TransportFactory> {
        let directory = Arc::new(Mutex::new(Directory::default()));
        Arc::new(move |_addr, instance, hooks| {
            let transport = MockTransport::new(instance, hooks, directory.clone());
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    }

    fn peer(&self, instance: InstanceId) -> Result<Peer> {
        self.0
            .directory
            .lock()?
            .by_instance
            .get(&instance)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("peer instance {instance}")))
    }
}

/// Accepts (or re-accepts) a pipe reading from `from`, retrying under
/// socket failure the way a real reconnecting pipe would, and returns the
/// instance id of the pipe that ultimately accepted cleanly, or `None` if
/// [MAX_ACCEPT_ATTEMPTS] was exceeded.
fn accept(state: &State, from: InstanceId) -> Option<InstanceId> {
    for _ in 0..MAX_ACCEPT_ATTEMPTS {
        let (pipe, is_new) = {
            let mut connections = state.connections.lock().unwrap();
            if let Some(existing) = connections.get(&from).and_then(|c| c.pipe_instance) {
                (existing, false)
            } else {
                let mut next = state.next_pipe_instance.lock().unwrap();
                let id = *next;
                *next += 1;
                connections.insert(from, Connection {
                    pipe_instance: Some(id),
                });
                (id, true)
            }
        };
        if is_new {
            let _ = state.hooks.report_state("Pipe::reader", pipe, StateRef::Name("create".to_owned()));
            let _ = state.hooks.report_state(
                "Pipe::reader",
                pipe,
                StateRef::Name("accept::open".to_owned()),
            );
        }
        let failed = state.hooks.pre_fail("Pipe::reader", pipe).unwrap_or(0) != 0;
        if !failed {
            return Some(pipe);
        }
        if is_new {
            let _ = state.hooks.report_state(
                "Pipe::reader",
                pipe,
                StateRef::Name("accept::fail_unlocked".to_owned()),
            );
        } else {
            let _ = state.hooks.lossy_connection_broke();
        }
        state.connections.lock().unwrap().remove(&from);
    }
    None
}

impl Transport for MockTransport {
    fn bind(&mut self, addr: &str) -> Result<()> {
        let mut directory = self.0.directory.lock()?;
        directory.by_instance.insert(
            self.0.instance,
            Peer {
                inbox: self.0.inbox_tx.clone(),
            },
        );
        let _ = addr;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let rx = self
            .0
            .inbox_rx
            .lock()?
            .take()
            .expect("start called twice on the same mock transport");
        let state = self.0.clone();
        let handle = std::thread::spawn(move || {
            for envelope in rx.iter() {
                match envelope {
                    Envelope::Connect(from) => {
                        accept(&state, from);
                    }
                    Envelope::Deliver(msg, from) => {
                        if accept(&state, from).is_some() {
                            let _ = state.hooks.message_received(msg, from);
                        }
                    }
                    Envelope::Reset(_from) => {
                        let _ = state.hooks.remote_reset();
                    }
                    Envelope::Shutdown => break,
                }
            }
        });
        *self.0.worker.lock()? = Some(handle);
        Ok(())
    }

    fn send(&mut self, msg: Message, dest: InstanceId) -> Result<()> {
        self.peer(dest)?
            .inbox
            .send(Envelope::Deliver(msg, self.0.instance))
            .map_err(|_| Error::NotConnected(dest.to_string()))
    }

    fn get_connection(&mut self, dest: InstanceId) -> Result<InstanceId> {
        let peer = self.peer(dest)?;
        let already_known = self.0.connections.lock()?.contains_key(&dest);
        if !already_known {
            peer.inbox
                .send(Envelope::Connect(self.0.instance))
                .map_err(|_| Error::NotConnected(dest.to_string()))?;
            self.0
                .connections
                .lock()?
                .insert(dest, Connection { pipe_instance: None });
        }
        Ok(dest)
    }

    fn mark_down(&mut self, dest: InstanceId) -> Result<()> {
        let existed = self.0.connections.lock()?.remove(&dest).is_some();
        if !existed {
            return Err(Error::NotConnected(dest.to_string()));
        }
        self.peer(dest)?
            .inbox
            .send(Envelope::Reset(self.0.instance))
            .map_err(|_| Error::NotConnected(dest.to_string()))
    }

    fn connection_instance(&self, dest: InstanceId) -> Option<InstanceId> {
        self.0
            .connections
            .lock()
            .ok()?
            .get(&dest)
            .and_then(|c| c.pipe_instance)
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = self.0.inbox_tx.send(Envelope::Shutdown);
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.0.worker.lock()?.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MockTransport;
    use crate::driver::{Message, DRIVER_SUBSYSTEM};
    use crate::err::Error;
    use crate::harness::Harness;
    use std::time::Duration;

    fn harness() -> Harness {
        Harness::new(MockTransport::factory())
    }

    #[test]
    fn round_trip_message() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();
        h.connect_messengers(&a, &b).unwrap();

        let received = h
            .lookup_state(DRIVER_SUBSYSTEM, "message_received")
            .unwrap();
        let alert = h.generate_alert(received);
        b.register_alert(alert.clone()).unwrap();

        let msg = Message::new(b"hello".to_vec());
        a.send(msg.clone(), b.instance()).unwrap();
        alert.wait_until_reached();

        let payload = alert.payload().unwrap();
        let got = payload.downcast_ref::<Message>().unwrap();
        assert_eq!(msg.bytes(), got.bytes());
        h.clean_up().unwrap();
    }

    #[test]
    fn remote_reset_propagates_then_delivery_resumes() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();

        let new_incoming = h
            .lookup_state(DRIVER_SUBSYSTEM, "new_incoming_connection")
            .unwrap();
        let connected = h.generate_alert(new_incoming);
        b.register_alert(connected.clone()).unwrap();

        h.connect_messengers(&a, &b).unwrap();
        // Wait for B to have actually accepted the pipe before tearing the
        // connection down, or break_connection could run before B's worker
        // thread has anything to tear down.
        connected.wait_until_reached();

        let reset_state = h.lookup_state(DRIVER_SUBSYSTEM, "remote_reset").unwrap();
        let reset_alert = h.generate_alert(reset_state);
        a.register_alert(reset_alert.clone()).unwrap();

        let received_state = h
            .lookup_state(DRIVER_SUBSYSTEM, "message_received")
            .unwrap();
        let received_alert = h.generate_alert(received_state);
        b.register_alert(received_alert.clone()).unwrap();

        b.break_connection(a.instance()).unwrap();
        // This send races the reset notification and is not required to
        // land; the point of interest is that the reset alert fires.
        let _ = a.send(Message::new(b"unsent".to_vec()), b.instance());
        reset_alert.wait_until_reached();

        let msg = Message::new(b"second".to_vec());
        a.send(msg.clone(), b.instance()).unwrap();
        received_alert.wait_until_reached();
        let got = received_alert.payload().unwrap();
        assert_eq!(msg.bytes(), got.downcast_ref::<Message>().unwrap().bytes());
        h.clean_up().unwrap();
    }

    #[test]
    fn socket_break_is_absorbed_by_reconnect() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();

        let new_incoming = h
            .lookup_state(DRIVER_SUBSYSTEM, "new_incoming_connection")
            .unwrap();
        let connected = h.generate_alert(new_incoming);
        b.register_alert(connected.clone()).unwrap();

        h.connect_messengers(&a, &b).unwrap();
        // Wait for B to have actually accepted the pipe before breaking its
        // socket, or break_socket's connection_instance lookup could run
        // before B's worker thread has recorded one.
        connected.wait_until_reached();

        let received_state = h
            .lookup_state(DRIVER_SUBSYSTEM, "message_received")
            .unwrap();
        let received_alert = h.generate_alert(received_state);
        b.register_alert(received_alert.clone()).unwrap();

        let lossy_state = h
            .lookup_state(DRIVER_SUBSYSTEM, "lossy_connection_broke")
            .unwrap();
        let lossy_alert = h.generate_alert(lossy_state);
        b.register_alert(lossy_alert.clone()).unwrap();

        b.break_socket(a.instance(), 1).unwrap();
        let msg = Message::new(b"resilient".to_vec());
        a.send(msg.clone(), b.instance()).unwrap();

        received_alert.wait_until_reached();
        lossy_alert.wait_until_reached();
        let got = received_alert.payload().unwrap();
        assert_eq!(msg.bytes(), got.downcast_ref::<Message>().unwrap().bytes());
        h.clean_up().unwrap();
    }

    #[test]
    fn break_at_specific_substate_then_deliver() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();

        let new_incoming = h
            .lookup_state(DRIVER_SUBSYSTEM, "new_incoming_connection")
            .unwrap();
        let gated = h.generate_alert(new_incoming);
        gated.require_signal_to_resume();
        b.register_alert(gated.clone()).unwrap();

        a.establish_connection(b.instance()).unwrap();
        gated.wait_until_reached();
        let pipe_instance = *gated.payload().unwrap().downcast_ref::<u64>().unwrap();

        let open = b
            .subsystem_registry("Pipe::reader")
            .unwrap()
            .lookup_by_name("accept::open")
            .unwrap();
        b.break_socket_in(pipe_instance, 1, &open).unwrap();

        let fail_registry = b.subsystem_registry("Pipe::reader").unwrap();
        let fail_state = fail_registry
            .lookup_by_name("accept::fail_unlocked")
            .or_else(|| {
                // Not yet auto-registered until the transport first reports it;
                // register it ourselves so we have an id to alert on.
                fail_registry
                    .create_state("accept::fail_unlocked", None)
                    .ok()
                    .and_then(|id| fail_registry.lookup_state(id))
            })
            .unwrap();
        let fail_alert = h.generate_alert(fail_state);
        b.register_subsystem_alert(fail_alert.clone(), "Pipe::reader", pipe_instance)
            .unwrap();

        gated.release();
        fail_alert.wait_until_reached();

        let received_state = h
            .lookup_state(DRIVER_SUBSYSTEM, "message_received")
            .unwrap();
        let received_alert = h.generate_alert(received_state);
        b.register_alert(received_alert.clone()).unwrap();
        let msg = Message::new(b"after-break".to_vec());
        a.send(msg.clone(), b.instance()).unwrap();
        received_alert.wait_until_reached();
        h.clean_up().unwrap();
    }

    #[test]
    fn stopped_driver_rejects_further_orders() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();
        a.stop().unwrap();
        assert!(matches!(
            a.send(Message::new(b"x".to_vec()), b.instance()),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(a.stop(), Err(Error::InvalidState { .. })));
        h.clean_up().unwrap();
    }

    #[test]
    fn break_connection_without_one_is_not_connected() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();
        assert!(matches!(
            a.break_connection(b.instance()),
            Err(Error::NotConnected(_))
        ));
        h.clean_up().unwrap();
    }

    #[test]
    fn duplicate_address_is_already_exists() {
        let h = harness();
        h.create_messenger("dup").unwrap();
        assert!(matches!(
            h.create_messenger("dup"),
            Err(Error::AlreadyExists(_))
        ));
        h.clean_up().unwrap();
    }

    #[test]
    fn gated_alert_blocks_worker_thread_until_released() {
        let h = harness();
        let a = h.create_messenger("a").unwrap();
        let b = h.create_messenger("b").unwrap();

        let received_state = h
            .lookup_state(DRIVER_SUBSYSTEM, "message_received")
            .unwrap();
        let gated = h.generate_alert(received_state);
        gated.require_signal_to_resume();
        b.register_alert(gated.clone()).unwrap();

        h.connect_messengers(&a, &b).unwrap();
        a.send(Message::new(b"gate-me".to_vec()), b.instance())
            .unwrap();
        gated.wait_until_reached();

        // The worker thread is now stalled inside set_reached.
        std::thread::sleep(Duration::from_millis(20));
        gated.release();
        h.clean_up().unwrap();
    }
}
