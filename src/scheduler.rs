//! Scheduler (spec §2.5, §4.5): delayed-send bookkeeping with real
//! cancellation.
//!
//! The teacher dispatches delayed sends through `timer::Timer`, but never
//! keeps the `timer::Guard` the crate returns — so `<cancel>` has nothing to
//! act on and is a `todo!()`. `Scheduler` keeps one `Guard` per `(SessionId,
//! SendId)` in a shared table; cancelling drops the guard, which the `timer`
//! crate defines to abort the pending callback before it runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::event::SendId;

pub type SessionId = u32;

/// A delayed callback the Scheduler keeps alive until it fires or is
/// cancelled. Delivery happens on the `timer` crate's background thread.
pub struct Scheduler {
    timer: timer::Timer,
    pending: Arc<Mutex<HashMap<(SessionId, SendId), timer::Guard>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            timer: timer::Timer::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `action` after `delay_ms`, or immediately if `delay_ms <= 0`.
    /// `send_id` must be unique within the session for the pending entry to
    /// be cancellable; an empty `send_id` means "not cancellable" (the entry
    /// is still run, just never tracked).
    pub fn schedule<F>(&self, session: SessionId, send_id: SendId, delay_ms: i64, action: F)
    where
        F: 'static + FnOnce() + Send,
    {
        if delay_ms <= 0 {
            action();
            return;
        }
        let pending = self.pending.clone();
        let key = (session, send_id.clone());
        let key_for_cleanup = key.clone();
        let mut action = Some(action);
        let guard = self.timer.schedule_with_delay(
            chrono::Duration::milliseconds(delay_ms),
            move || {
                if let Some(a) = action.take() {
                    a();
                }
                pending.lock().unwrap().remove(&key_for_cleanup);
            },
        );
        if !send_id.is_empty() {
            self.pending.lock().unwrap().insert(key, guard);
        } else {
            guard.ignore();
        }
    }

    /// *W3C says* (6.3 `<cancel>`): "the SCXML Processor MUST cancel the
    /// delayed event with the specified id if it has not yet been sent."
    /// Returns `true` if a pending send was found and cancelled.
    pub fn cancel(&self, session: SessionId, send_id: &str) -> bool {
        let removed = self
            .pending
            .lock()
            .unwrap()
            .remove(&(session, send_id.to_string()));
        match removed {
            Some(guard) => {
                drop(guard);
                info!("cancelled pending send {:?} in session {}", send_id, session);
                true
            }
            None => {
                warn!("cancel: no pending send {:?} in session {}", send_id, session);
                false
            }
        }
    }

    /// Drops every pending send for `session` without running them, used
    /// when a session terminates.
    pub fn cancel_all(&self, session: SessionId) {
        self.pending
            .lock()
            .unwrap()
            .retain(|(sess, _), _| *sess != session);
    }

    pub fn pending_count(&self, session: SessionId) -> usize {
        self.pending
            .lock()
            .unwrap()
            .keys()
            .filter(|(sess, _)| *sess == session)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn cancel_before_fire_prevents_delivery() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        scheduler.schedule(1, "send1".to_string(), 200, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        assert_eq!(scheduler.pending_count(1), 1);
        assert!(scheduler.cancel(1, "send1"));
        std::thread::sleep(Duration::from_millis(350));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_delay_runs_synchronously() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        scheduler.schedule(1, String::new(), 0, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_unknown_send_id_is_a_noop() {
        let scheduler = Scheduler::new();
        assert!(!scheduler.cancel(1, "nope"));
    }
}
