//! Session (spec §3 "Session", §4.6 Invoke, §4.5 Send/Cancel): the runtime
//! state of one running SCXML instance — configuration, queues, data model
//! binding, invoke bookkeeping, history, and the resources (Scheduler,
//! Registry) it shares with the rest of the process.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use log::{debug, warn};

use crate::collections::Queue;
use crate::data_model::{Datamodel, IoProcessorInfo};
use crate::event::{Event, InvokeId, SendId};
use crate::executable_content::{ActionSink, SendRequest};
use crate::model::{Document, StateId};
use crate::registry::{Registry, Route, SessionHandle};
use crate::scheduler::{Scheduler, SessionId};
use crate::tracer::Tracer;

/// Host-supplied configuration for a new session (§6.3 ambient config: the
/// core's only configuration surface), applied via `Session::with_config`
/// after construction.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub name: Option<String>,
    pub initial_data: HashMap<String, crate::data_model::Data>,
}

/// One `<invoke>` activation tracked against the state that declared it.
pub struct InvocationRecord {
    pub invoke_id: InvokeId,
    pub owner_state: StateId,
    pub child_session: SessionId,
    pub autoforward: bool,
}

/// Per-state invoke bookkeeping (spec §4.6 SUPPLEMENT). Keyed by
/// `invoke_id` so cancellation and `done.invoke` correlation are O(1).
#[derive(Default)]
pub struct InvokeRegistry {
    by_invoke_id: HashMap<InvokeId, InvocationRecord>,
}

impl InvokeRegistry {
    pub fn new() -> InvokeRegistry {
        InvokeRegistry::default()
    }

    pub fn insert(&mut self, record: InvocationRecord) {
        self.by_invoke_id.insert(record.invoke_id.clone(), record);
    }

    pub fn remove(&mut self, invoke_id: &str) -> Option<InvocationRecord> {
        self.by_invoke_id.remove(invoke_id)
    }

    pub fn get(&self, invoke_id: &str) -> Option<&InvocationRecord> {
        self.by_invoke_id.get(invoke_id)
    }

    /// All invocations owned by `state`, used when the interpreter exits a
    /// state and must cancel every child it ever invoked (spec §4.6,
    /// "invoke is cancelled... when the state is exited").
    pub fn owned_by(&self, state: StateId) -> Vec<InvokeId> {
        self.by_invoke_id
            .values()
            .filter(|r| r.owner_state == state)
            .map(|r| r.invoke_id.clone())
            .collect()
    }

    pub fn autoforward_targets(&self) -> Vec<SessionId> {
        self.by_invoke_id
            .values()
            .filter(|r| r.autoforward)
            .map(|r| r.child_session)
            .collect()
    }
}

/// Shallow/deep history snapshot, one per `<history>` pseudo-state that has
/// ever been recorded (spec §3 "History Record").
#[derive(Default)]
pub struct HistoryStore {
    recorded: HashMap<StateId, Vec<StateId>>,
}

impl HistoryStore {
    pub fn new() -> HistoryStore {
        HistoryStore::default()
    }

    pub fn record(&mut self, history_state: StateId, configuration: Vec<StateId>) {
        self.recorded.insert(history_state, configuration);
    }

    pub fn get(&self, history_state: StateId) -> Option<&[StateId]> {
        self.recorded.get(&history_state).map(|v| v.as_slice())
    }
}

pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub document: Arc<Document>,
    pub datamodel: Box<dyn Datamodel>,
    pub configuration: Vec<StateId>,
    pub history: HistoryStore,
    pub invokes: InvokeRegistry,
    pub internal_queue: Queue<Event>,
    pub external_receiver: Receiver<Event>,
    pub tracer: Box<dyn Tracer>,
    pub running: bool,
    pub scheduler: Arc<Scheduler>,
    pub registry: Registry,
    /// States entered since the last macrostep completed, invoked (in entry
    /// order) once the macrostep settles (spec §4.4 `mainEventLoop`).
    pub states_to_invoke: Vec<StateId>,
    /// Set once per `StateId` the first time its `<datamodel>` is
    /// initialized, so late-bound data is only ever bound on first entry.
    data_initialized: Vec<bool>,
    /// Host-supplied hook for starting/cancelling `<invoke>` children. `None`
    /// means `<invoke>` is unsupported (e.g. a bare library embedding with no
    /// document loader wired up).
    pub invoke_host: Option<Arc<dyn crate::interpreter::InvokeHost>>,
    /// Host-supplied variable bindings applied once `initialize` has run the
    /// document's own `<datamodel>` initializers, so a host's values take
    /// priority over the document's defaults (spec §6.3 ambient config).
    pub initial_data: HashMap<String, crate::data_model::Data>,
    send_id_seq: u32,
    invoke_id_seq: u32,
    platform_id: String,
    current_state_for_ids: Option<StateId>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        name: String,
        document: Arc<Document>,
        datamodel: Box<dyn Datamodel>,
        external_receiver: Receiver<Event>,
        tracer: Box<dyn Tracer>,
        scheduler: Arc<Scheduler>,
        registry: Registry,
        platform_id: String,
    ) -> Session {
        let state_count = document.states().count();
        Session {
            id,
            name,
            document,
            datamodel,
            configuration: Vec::new(),
            history: HistoryStore::new(),
            invokes: InvokeRegistry::new(),
            internal_queue: Queue::new(),
            external_receiver,
            tracer,
            running: false,
            scheduler,
            registry,
            states_to_invoke: Vec::new(),
            data_initialized: vec![false; state_count + 1],
            invoke_host: None,
            initial_data: HashMap::new(),
            send_id_seq: 0,
            invoke_id_seq: 0,
            platform_id,
            current_state_for_ids: None,
        }
    }

    pub fn with_invoke_host(mut self, host: Arc<dyn crate::interpreter::InvokeHost>) -> Session {
        self.invoke_host = Some(host);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Session {
        if let Some(name) = config.name {
            self.name = name;
        }
        self.initial_data = config.initial_data;
        self
    }

    pub fn is_data_initialized(&self, state: StateId) -> bool {
        self.data_initialized[state as usize]
    }

    pub fn mark_data_initialized(&mut self, state: StateId) {
        self.data_initialized[state as usize] = true;
    }

    pub fn io_processor_info(&self) -> Vec<IoProcessorInfo> {
        vec![IoProcessorInfo {
            type_uri: crate::data_model::SCXML_EVENT_PROCESSOR.to_string(),
            location: format!("#_scxml_{}", self.id),
        }]
    }

    /// Called by the interpreter right before running a state's
    /// onentry/onexit/transition content, so generated send/invoke ids carry
    /// the owning state's name (spec §3.2).
    pub fn set_current_state_for_ids(&mut self, state: Option<StateId>) {
        self.current_state_for_ids = state;
    }

    pub fn next_invoke_id(&mut self) -> InvokeId {
        self.invoke_id_seq += 1;
        let state_name = self
            .current_state_for_ids
            .map(|s| self.document.state(s).name.clone())
            .unwrap_or_else(|| "scxml".to_string());
        format!("{}.{}.{}", state_name, self.platform_id, self.invoke_id_seq)
    }

    /// Borrows the datamodel and an `ActionSink` view of the rest of the
    /// session as two disjoint mutable borrows, so
    /// `executable_content::execute_block` can run without the caller
    /// needing unsafe code or interior mutability.
    pub fn split_for_execution(&mut self) -> (&mut dyn Datamodel, SessionSink<'_>) {
        let sink = SessionSink {
            session_id: self.id,
            internal_queue: &mut self.internal_queue,
            scheduler: &self.scheduler,
            registry: &self.registry,
            send_id_seq: &mut self.send_id_seq,
            platform_id: &self.platform_id,
            current_state: self
                .current_state_for_ids
                .map(|s| self.document.state(s).name.clone()),
        };
        (self.datamodel.as_mut(), sink)
    }
}

/// `ActionSink` implementation backed by a live `Session`'s queues and
/// shared resources. Borrowed out of `Session::split_for_execution` so the
/// datamodel can be borrowed independently.
pub struct SessionSink<'a> {
    session_id: SessionId,
    internal_queue: &'a mut Queue<Event>,
    scheduler: &'a Scheduler,
    registry: &'a Registry,
    send_id_seq: &'a mut u32,
    platform_id: &'a str,
    current_state: Option<String>,
}

impl<'a> ActionSink for SessionSink<'a> {
    fn raise_internal(&mut self, event: Event) {
        self.internal_queue.enqueue(event);
    }

    fn log(&mut self, label: Option<&str>, message: &str) {
        match label {
            Some(l) if !l.is_empty() => debug!("[{}] {}", l, message),
            _ => debug!("{}", message),
        }
    }

    fn send(&mut self, req: SendRequest) {
        let send_id = if req.send_id.is_empty() {
            self.generate_send_id()
        } else {
            req.send_id.clone()
        };
        // *W3C says* (6.4 `<send target="#_parent">`): the event delivered to
        // the parent carries `_event.invokeid` set to the sending session's
        // own invoke id, which is how the parent's `<finalize>` (spec §4.6)
        // correlates an external event back to the invoke that produced it.
        let own_invoke_id = if req.target == crate::registry::TARGET_PARENT {
            self.registry.invoke_id_for(self.session_id)
        } else {
            None
        };
        let event = Event::external(req.event_name)
            .with_send_id(Some(send_id.clone()))
            .with_invoke_id(own_invoke_id)
            .with_data(req.content.or_else(|| {
                if req.params.is_empty() {
                    None
                } else {
                    Some(crate::data_model::Data::Map(req.params.clone()))
                }
            }));

        match self.registry.resolve(self.session_id, &req.target) {
            Route::Internal => {
                // `<send>` rejects delay>0 for `#_internal` before reaching
                // here, so this always runs synchronously.
                let event = Event {
                    event_type: crate::event::EventType::Internal,
                    ..event
                };
                self.internal_queue.enqueue(event);
            }
            Route::Session(sender) => {
                self.scheduler
                    .schedule(self.session_id, send_id, req.delay_ms, move || {
                        let _ = sender.send(event);
                    });
            }
            Route::Unsupported => {
                #[cfg(feature = "basic-http")]
                if req.target.starts_with("http://") || req.target.starts_with("https://") {
                    let target = req.target.clone();
                    let event_name = req.event_name.clone();
                    let params = req.params.clone();
                    self.scheduler
                        .schedule(self.session_id, send_id, req.delay_ms, move || {
                            if let Err(e) =
                                crate::io_processor::http::send_to_url(&target, &event_name, &params)
                            {
                                warn!("BasicHTTP send to '{}' failed: {}", target, e);
                            }
                        });
                    return;
                }
                // *W3C says* (listed under error.communication): an unknown
                // session/invoke id is a reachable-transport, unreachable-peer
                // failure, not a validation failure — `execute_send` already
                // rejected unsupported `type`/malformed targets as
                // `error.execution` before this ever runs.
                warn!("send: unresolved target '{}'", req.target);
                self.internal_queue
                    .enqueue(Event::error_communication(Some(send_id), None));
            }
        }
    }

    fn cancel(&mut self, send_id: &str) {
        self.scheduler.cancel(self.session_id, send_id);
    }

    fn raise_error_execution(&mut self) {
        self.internal_queue.enqueue(Event::error_execution());
    }

    fn raise_error_communication(&mut self, send_id: Option<SendId>, invoke_id: Option<InvokeId>) {
        self.internal_queue
            .enqueue(Event::error_communication(send_id, invoke_id));
    }

    fn generate_send_id(&mut self) -> String {
        *self.send_id_seq += 1;
        format!(
            "{}.{}.{}",
            self.current_state.as_deref().unwrap_or("scxml"),
            self.platform_id,
            self.send_id_seq
        )
    }
}

/// Wires a freshly built `Session` into the registry so other sessions can
/// address it via `#_scxml_<id>`/`#_parent`/`#_<invokeid>`.
pub fn register_session(registry: &Registry, id: SessionId, sender: Sender<Event>, parent: Option<SessionId>) {
    registry.register(SessionHandle { id, sender, parent });
}
