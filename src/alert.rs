//! The state-alert rendezvous.
//!
//! A [StateAlert] is a single-shot synchronisation point tied to one
//! [State][crate::registry::State]: test code creates one, registers it on a
//! driver, and blocks on it; the driver fires it the next time its watched
//! state is reached. An alert may additionally be *gated*, in which case the
//! firing thread (the transport's own thread) stalls inside [StateAlert::set_reached]
//! until the observer calls [StateAlert::release], which is how a test can
//! hold the instrumented thread still at a transition while it does
//! something else (typically, injecting a fault) before letting it proceed.

use crate::registry::State;
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A type-erased, reference-counted payload an alert carries when it fires.
///
/// The alert does not own or interpret the payload; ownership is entirely
/// test-defined. Callers downcast it back to whatever concrete type the
/// firing side put in.
pub type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Inner {
    reached: bool,
    payload: Option<Payload>,
    gated: bool,
    released: bool,
}

struct Shared {
    watched: Arc<State>,
    inner: Mutex<Inner>,
    cond: Condvar,
    /// An additional mutex/condvar pair a test may supply so that it can
    /// block on several distinct alerts through one shared condition,
    /// re-polling each alert's [StateAlert::is_reached] on wake rather than
    /// spawning one waiter thread per alert. `set_reached` and `release`
    /// notify this in addition to the alert's own internal condition.
    external: Option<(Arc<Mutex<()>>, Arc<Condvar>)>,
}

/// A single-shot rendezvous for one state observation.
///
/// Cloning an `Alert` is cheap and shares the same underlying rendezvous;
/// this is how the same alert ends up held by both the test that created it
/// and the driver(s) it is registered on.
#[derive(Clone)]
pub struct StateAlert(Arc<Shared>);

impl StateAlert {
    /// Creates a new, unreached alert watching `state`, with its own
    /// internal mutex/condvar pair.
    #[must_use]
    pub fn new(state: Arc<State>) -> Self {
        Self(Arc::new(Shared {
            watched: state,
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            external: None,
        }))
    }

    /// As [Self::new], but additionally notifies the caller-supplied
    /// `lock`/`cond` pair whenever this alert reaches or is released, so a
    /// test waiting on several alerts can wake on one shared condition.
    #[must_use]
    pub fn with_condition(state: Arc<State>, lock: Arc<Mutex<()>>, cond: Arc<Condvar>) -> Self {
        Self(Arc::new(Shared {
            watched: state,
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            external: Some((lock, cond)),
        }))
    }

    /// The state this alert watches.
    #[must_use]
    pub fn watched(&self) -> &Arc<State> {
        &self.0.watched
    }

    /// Marks this alert as gated: once fired, [Self::set_reached] will not
    /// return until [Self::release] is called. Must be called before the
    /// alert is registered on a driver, since firing may race with
    /// registration otherwise.
    pub fn require_signal_to_resume(&self) {
        let mut inner = self.lock_inner();
        inner.gated = true;
    }

    /// Fires the alert: records `payload`, marks it reached, and wakes every
    /// waiter. Must be called at most once per alert; a second call is a
    /// harness-author bug and panics rather than returning an error, since
    /// there is no sensible recovery for a signaling side that violates its
    /// own single-shot contract.
    ///
    /// If the alert is gated, this call then blocks the calling thread
    /// until [Self::release] is invoked.
    pub fn set_reached(&self, payload: Option<Payload>) {
        let mut inner = self.lock_inner();
        assert!(!inner.reached, "set_reached called twice on the same alert");
        inner.reached = true;
        inner.payload = payload;
        self.0.cond.notify_all();
        self.notify_external();
        let gated = inner.gated;
        if gated {
            while !inner.released {
                inner = self
                    .0
                    .cond
                    .wait(inner)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }
    }

    /// Unblocks a gated, already-fired alert's signaling thread. A no-op if
    /// the alert is not gated, or has not yet reached.
    pub fn release(&self) {
        let mut inner = self.lock_inner();
        if inner.gated && inner.reached && !inner.released {
            inner.released = true;
            self.0.cond.notify_all();
            self.notify_external();
        }
    }

    /// Whether this alert has reached. Should only be relied upon after
    /// waiting on the alert's condition (e.g. via [Self::wait_until_reached])
    /// or, for the multi-alert pattern, after waking from a shared external
    /// condition this alert was constructed with.
    #[must_use]
    pub fn is_reached(&self) -> bool {
        self.lock_inner().reached
    }

    /// The payload recorded by [Self::set_reached], if the alert has fired
    /// and was given one.
    #[must_use]
    pub fn payload(&self) -> Option<Payload> {
        self.lock_inner().payload.clone()
    }

    /// Blocks the calling thread until this alert reaches.
    pub fn wait_until_reached(&self) {
        let mut inner = self.lock_inner();
        while !inner.reached {
            inner = self
                .0
                .cond
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.0
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify_external(&self) {
        if let Some((lock, cond)) = &self.0.external {
            if let Ok(_guard) = lock.lock() {
                cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::thread;
    use std::time::Duration;

    fn state() -> Arc<State> {
        let r = Registry::new("MessengerDriver");
        let id = r.create_state("message_received", None).unwrap();
        r.lookup_state(id).unwrap()
    }

    #[test]
    fn starts_unreached() {
        let a = StateAlert::new(state());
        assert!(!a.is_reached());
        assert!(a.payload().is_none());
    }

    #[test]
    fn set_reached_records_payload() {
        let a = StateAlert::new(state());
        a.set_reached(Some(Arc::new(42u64)));
        assert!(a.is_reached());
        let payload = a.payload().unwrap();
        assert_eq!(42u64, *payload.downcast_ref::<u64>().unwrap());
    }

    #[test]
    #[should_panic(expected = "set_reached called twice")]
    fn double_set_reached_panics() {
        let a = StateAlert::new(state());
        a.set_reached(None);
        a.set_reached(None);
    }

    #[test]
    fn wait_until_reached_blocks_until_fired() {
        let a = StateAlert::new(state());
        let waiter = a.clone();
        let handle = thread::spawn(move || {
            waiter.wait_until_reached();
            waiter.payload()
        });
        thread::sleep(Duration::from_millis(20));
        a.set_reached(Some(Arc::new(7i32)));
        let payload = handle.join().unwrap().unwrap();
        assert_eq!(7, *payload.downcast_ref::<i32>().unwrap());
    }

    #[test]
    fn gated_alert_stalls_signaler_until_released() {
        let a = StateAlert::new(state());
        a.require_signal_to_resume();
        let signaler = a.clone();
        let released = Arc::new(Mutex::new(false));
        let released_thread = released.clone();
        let handle = thread::spawn(move || {
            signaler.set_reached(None);
            *released_thread.lock().unwrap() = true;
        });

        // Give the signaling thread a chance to enter set_reached and block.
        thread::sleep(Duration::from_millis(30));
        assert!(!*released.lock().unwrap());
        assert!(a.is_reached());

        a.release();
        handle.join().unwrap();
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn release_before_reached_is_noop() {
        let a = StateAlert::new(state());
        a.require_signal_to_resume();
        a.release();
        assert!(!a.is_reached());
    }

    #[test]
    fn shared_external_condition_wakes_on_either_alert() {
        let lock = Arc::new(Mutex::new(()));
        let cond = Arc::new(Condvar::new());
        let a = StateAlert::with_condition(state(), lock.clone(), cond.clone());
        let b = StateAlert::with_condition(state(), lock.clone(), cond.clone());

        let fired = b.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fired.set_reached(None);
        });

        let guard = lock.lock().unwrap();
        let _guard = cond
            .wait_timeout_while(guard, Duration::from_secs(5), |()| {
                !a.is_reached() && !b.is_reached()
            })
            .unwrap();
        assert!(b.is_reached());
        assert!(!a.is_reached());
    }
}
