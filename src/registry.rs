//! Session Registry (spec §2.6, §6 cross-session send targets):
//! process-wide directory of running sessions, generalizing the teacher's
//! `FsmExecutor`/`ExecuteState`.
//!
//! Every `Session` is handed a `Registry` handle at construction. The
//! registry is the only thing that knows how to resolve `#_parent`,
//! `#_<invokeid>` and `#_scxml_<sessionid>` targets into a concrete
//! `mpsc::Sender`, so `<send>` dispatch never has to walk session internals
//! directly.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::event::Event;
use crate::scheduler::SessionId;

pub const TARGET_INTERNAL: &str = "#_internal";
pub const TARGET_PARENT: &str = "#_parent";
pub const TARGET_SCXML_PREFIX: &str = "#_scxml_";
pub const TARGET_INVOKE_PREFIX: &str = "#_";

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub sender: Sender<Event>,
    pub parent: Option<SessionId>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionHandle>,
    /// invokeid -> child SessionId, populated by the parent session when it
    /// starts an `<invoke>` child, used to resolve `#_<invokeid>` targets.
    invocations: HashMap<String, SessionId>,
    next_session_id: SessionId,
}

/// Cloneable directory handle; every `Session` keeps one.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

/// Resolution outcome for a `<send>` target, consumed by the interpreter
/// when it drains `ActionSink::send` requests (spec §6.5).
pub enum Route {
    Internal,
    Session(Sender<Event>),
    Unsupported,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            state: Arc::new(Mutex::new(RegistryState {
                next_session_id: 1,
                ..Default::default()
            })),
        }
    }

    pub fn allocate_session_id(&self) -> SessionId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_session_id;
        state.next_session_id += 1;
        id
    }

    pub fn register(&self, handle: SessionHandle) {
        self.state.lock().unwrap().sessions.insert(handle.id, handle);
    }

    pub fn deregister(&self, session: SessionId) {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(&session);
        state.invocations.retain(|_, sid| *sid != session);
    }

    pub fn record_invocation(&self, invoke_id: String, child_session: SessionId) {
        self.state.lock().unwrap().invocations.insert(invoke_id, child_session);
    }

    pub fn forget_invocation(&self, invoke_id: &str) {
        self.state.lock().unwrap().invocations.remove(invoke_id);
    }

    pub fn sender_for(&self, session: SessionId) -> Option<Sender<Event>> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(&session)
            .map(|h| h.sender.clone())
    }

    pub fn parent_of(&self, session: SessionId) -> Option<SessionId> {
        self.state.lock().unwrap().sessions.get(&session)?.parent
    }

    /// Reverse lookup of `record_invocation`: the invoke id a parent session
    /// used to start `session`, if any. Used to correlate `done.invoke.<id>`
    /// when `session` itself terminates (spec §4.6 SUPPLEMENT).
    pub fn invoke_id_for(&self, session: SessionId) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .invocations
            .iter()
            .find(|(_, sid)| **sid == session)
            .map(|(id, _)| id.clone())
    }

    /// *W3C says* (C.2 Event I/O Processors): `#_internal` goes back onto the
    /// sending session's own internal queue, `#_parent` onto the parent
    /// session's external queue, `#_<invokeid>` onto a specific invoked
    /// child's, and `#_scxml_<sessionid>` onto an arbitrary session's by id.
    /// *W3C also says* (6.2.4 `<send>`): "If the target is not specified...
    /// the SCXML Processor must add the event to the external event queue of
    /// the sending session" — a target-less send is therefore NOT the same
    /// as `#_internal`: it is routed back to this session's own sender, so it
    /// lands on `external_receiver` behind anything already queued internally
    /// (spec §8 invariant 4 / seed scenario A).
    pub fn resolve(&self, from_session: SessionId, target: &str) -> Route {
        if target == TARGET_INTERNAL {
            return Route::Internal;
        }
        if target.is_empty() {
            return self
                .sender_for(from_session)
                .map(Route::Session)
                .unwrap_or(Route::Internal);
        }
        if target == TARGET_PARENT {
            return match self.parent_of(from_session) {
                Some(parent) => self
                    .sender_for(parent)
                    .map(Route::Session)
                    .unwrap_or(Route::Unsupported),
                None => {
                    warn!("#_parent target used by session {} with no parent", from_session);
                    Route::Unsupported
                }
            };
        }
        if let Some(rest) = target.strip_prefix(TARGET_SCXML_PREFIX) {
            return match rest.parse::<SessionId>().ok().and_then(|id| self.sender_for(id)) {
                Some(sender) => Route::Session(sender),
                None => Route::Unsupported,
            };
        }
        if let Some(invoke_id) = target.strip_prefix(TARGET_INVOKE_PREFIX) {
            let target_session = self.state.lock().unwrap().invocations.get(invoke_id).copied();
            return match target_session.and_then(|id| self.sender_for(id)) {
                Some(sender) => Route::Session(sender),
                None => Route::Unsupported,
            };
        }
        Route::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn parent_target_resolves_through_registered_parent() {
        let registry = Registry::new();
        let (parent_tx, _parent_rx) = channel();
        registry.register(SessionHandle {
            id: 1,
            sender: parent_tx,
            parent: None,
        });
        let (child_tx, _child_rx) = channel();
        registry.register(SessionHandle {
            id: 2,
            sender: child_tx,
            parent: Some(1),
        });
        assert!(matches!(registry.resolve(2, "#_parent"), Route::Session(_)));
    }

    #[test]
    fn invoke_target_resolves_via_recorded_invocation() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(SessionHandle {
            id: 5,
            sender: tx,
            parent: None,
        });
        registry.record_invocation("child1".to_string(), 5);
        assert!(matches!(registry.resolve(1, "#_child1"), Route::Session(_)));
    }

    #[test]
    fn unknown_target_is_unsupported() {
        let registry = Registry::new();
        assert!(matches!(registry.resolve(1, "#_scxml_999"), Route::Unsupported));
    }

    #[test]
    fn empty_target_routes_to_self_not_internal() {
        let registry = Registry::new();
        let (tx, _rx) = channel();
        registry.register(SessionHandle {
            id: 1,
            sender: tx,
            parent: None,
        });
        assert!(matches!(registry.resolve(1, ""), Route::Session(_)));
        assert!(matches!(registry.resolve(1, TARGET_INTERNAL), Route::Internal));
    }
}
