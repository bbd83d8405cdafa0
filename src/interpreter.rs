//! Interpreter (spec §4.4): the W3C SCXML 1.0 microstep/macrostep algorithm.
//!
//! Grounded directly on the teacher's `fsm.rs`, which carries the W3C
//! pseudocode as doc comments above each function — this module keeps that
//! one-function-per-algorithm-step shape but operates over the arena-indexed
//! `Document`/`Session` split instead of a monolithic struct mixing document
//! and runtime state. Every side-effecting step (entering/exiting a state,
//! running a block of executable content, raising an event) goes through a
//! `Session`; everything else (`getTransitionDomain`, `computeExitSet`,
//! `computeEntrySet`, ...) is a pure function over `&Document`/`&HistoryStore`
//! so it can be unit tested without a live session.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::data_model::{BindingType, Data};
use crate::event::{Event, InvokeId, ParamValues};
use crate::executable_content;
use crate::model::{
    Document, ExecutableContentId, HistoryType, InvokeDecl, StateId, TransitionId,
    TransitionType, NONE,
};
use crate::scheduler::SessionId;
use crate::session::{HistoryStore, InvocationRecord, Session};
use crate::tracer::TraceRecord;

/// Host-supplied hook for starting and cancelling `<invoke>` children.
/// `interpreter` never parses documents or spawns threads itself — that
/// requires the document loader and the session registry, both of which
/// live above this module — so the concrete implementation is wired in by
/// the host (see `lib.rs`) and handed to each `Session` that may need it.
pub trait InvokeHost: Send + Sync {
    /// Starts a new child session for `decl`, already resolved to a
    /// concrete `type_name`/`src`/inline `content`. Implementations must
    /// register the invocation with the Session Registry (so `#_parent`
    /// sends and `done.invoke.<id>` correlation can find it) *before* the
    /// child can start running — a child that reaches `<final>` immediately
    /// must not race the caller recording it. Returns the child's
    /// `SessionId` on success so the interpreter can track it in the
    /// per-session `InvokeRegistry`.
    #[allow(clippy::too_many_arguments)]
    fn start(
        &self,
        parent: SessionId,
        invoke_id: &str,
        type_name: &str,
        src: Option<&str>,
        content: Option<&str>,
        params: &ParamValues,
    ) -> Result<SessionId, String>;

    /// Best-effort request to terminate a previously started child.
    fn cancel(&self, child: SessionId);
}

/// *W3C says* (§3.2 "procedure interpret(doc)"): validates the document,
/// initializes the data model (for `early` binding), runs the top-level
/// `<script>`, and enters the initial configuration. Does not start the
/// main event loop — callers that want the blocking loop call `run`.
pub fn initialize(session: &mut Session) {
    let document = session.document.clone();

    let session_id = session.id.to_string();
    let session_name = session.name.clone();
    let io_processors = session.io_processor_info();
    {
        let (datamodel, _sink) = session.split_for_execution();
        datamodel.setup_system_variables(&session_id, &session_name, &io_processors, &document);
    }

    if document.binding == BindingType::Early {
        let state_ids: Vec<StateId> = document.states().map(|s| s.id).collect();
        let (datamodel, mut sink) = session.split_for_execution();
        for state in &state_ids {
            for _ in datamodel.initialize_data(&document, *state) {
                sink.raise_error_execution();
            }
        }
        for state in state_ids {
            session.mark_data_initialized(state);
        }
    } else {
        session.mark_data_initialized(document.root);
    }

    if !session.initial_data.is_empty() {
        let overrides: Vec<(String, Data)> = session
            .initial_data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let (datamodel, _sink) = session.split_for_execution();
        for (name, value) in overrides {
            datamodel.set_variable(&name, value);
        }
    }

    session.running = true;

    if let Some(script) = &document.script {
        let script = script.clone();
        let (datamodel, mut sink) = session.split_for_execution();
        if let Err(e) = datamodel.execute_script(&script) {
            warn!("top-level <script> failed: {}", e);
            sink.raise_error_execution();
        }
    }

    let mut initial = Vec::new();
    if document.initial_transition != NONE {
        initial.push(document.initial_transition);
    }
    microstep(session, &initial);
}

/// Runs `initialize` followed by the blocking main event loop (§4.4
/// `mainEventLoop`). Returns when the session reaches a top-level final
/// state or its external receiver is disconnected (the host dropped every
/// sender, which stands in for "cancel processing").
pub fn run(session: &mut Session) {
    initialize(session);
    main_event_loop(session);
}

/// *W3C says* (§3.2 "procedure mainEventLoop()"): completes a macrostep by
/// repeatedly taking eventless/internal-event transitions, then invokes any
/// `<invoke>` elements for newly entered states, then blocks for an external
/// event and takes whatever it enables before repeating.
fn main_event_loop(session: &mut Session) {
    while session.running {
        run_macrostep(session);
        if !session.running {
            break;
        }

        run_pending_invokes(session);
        if !session.internal_queue.is_empty() {
            continue;
        }

        let external_event = match session.external_receiver.recv() {
            Ok(event) => event,
            Err(_) => {
                session.running = false;
                break;
            }
        };
        session.tracer.trace(TraceRecord::EventProcessed(external_event.clone()));

        apply_finalize_and_autoforward(session, &external_event);

        let (datamodel, _sink) = session.split_for_execution();
        datamodel.set_current_event(&external_event);

        let enabled = select_transitions(session, &external_event);
        if !enabled.is_empty() {
            microstep(session, &enabled);
        }
    }
    exit_interpreter(session);
}

/// Drains eventless transitions and internally queued events until neither
/// produces any enabled transition — the definition of "macrostep done".
fn run_macrostep(session: &mut Session) {
    loop {
        let mut enabled = select_eventless_transitions(session);
        if enabled.is_empty() {
            let internal_event = match session.internal_queue.dequeue() {
                None => return,
                Some(e) => e,
            };
            session.tracer.trace(TraceRecord::EventProcessed(internal_event.clone()));
            {
                let (datamodel, _sink) = session.split_for_execution();
                datamodel.set_current_event(&internal_event);
            }
            enabled = select_transitions(session, &internal_event);
        }
        if enabled.is_empty() {
            if !session.running {
                return;
            }
            continue;
        }
        microstep(session, &enabled);
        if !session.running {
            return;
        }
    }
}

/// *W3C says*: `<finalize>` is applied to an external event correlated by
/// `invokeid` before transitions are selected; events from autoforwarding
/// invokes are relayed verbatim to every invoked child with `autoforward`
/// set.
fn apply_finalize_and_autoforward(session: &mut Session, event: &Event) {
    let document = session.document.clone();
    if let Some(invoke_id) = &event.invoke_id {
        if let Some(record) = session.invokes.get(invoke_id) {
            let owner = record.owner_state;
            let finalize: Vec<ExecutableContentId> = document
                .state(owner)
                .invoke
                .iter()
                .find(|inv| inv.id.as_deref() == Some(invoke_id.as_str()))
                .map(|inv| inv.finalize.clone())
                .unwrap_or_default();
            for cid in finalize {
                execute_content_id(session, &document, cid);
            }
        }
    }
    for target in session.invokes.autoforward_targets() {
        if let Some(sender) = session.registry.sender_for(target) {
            let _ = sender.send(event.clone());
        }
    }
}

/// *W3C says* (§3.2 "procedure exitInterpreter()"): exits every active state
/// in exit order, running `onexit` and cancelling invokes, and returns a
/// `done.invoke.<id>` to the parent session if this session was itself
/// invoked.
fn exit_interpreter(session: &mut Session) {
    let document = session.document.clone();
    let mut ordered: Vec<StateId> = session.configuration.clone();
    ordered.sort_by(|a, b| document.document_order(*b, *a));

    let mut final_top_level: Option<StateId> = None;
    for &s in &ordered {
        for &cid in &document.state(s).onexit.clone() {
            execute_content_id(session, &document, cid);
        }
        let invoke_ids = session.invokes.owned_by(s);
        for id in invoke_ids {
            cancel_invoke(session, &id);
        }
        session.configuration.retain(|c| *c != s);
        if document.state(s).is_final && document.state(s).parent == document.root {
            final_top_level = Some(s);
        }
    }

    session.scheduler.cancel_all(session.id);

    if let Some(s) = final_top_level {
        let donedata = evaluate_donedata(session, &document, s);
        return_done_event(session, donedata);
    }
}

/// Sends `done.invoke.<id>` to the parent session that invoked this one, if
/// any (spec §4.6 SUPPLEMENT: done-event correlation via the generated
/// invoke id this session was started with).
fn return_done_event(session: &mut Session, donedata: Option<Data>) {
    let (parent, invoke_id) = match session.registry.parent_of(session.id) {
        Some(parent) => match session.registry.invoke_id_for(session.id) {
            Some(id) => (parent, id),
            None => return,
        },
        None => return,
    };
    if let Some(sender) = session.registry.sender_for(parent) {
        let _ = sender.send(Event::done_invoke(&invoke_id, donedata));
    }
}

/// *W3C says* (§3.2 "function selectEventlessTransitions()"): for every
/// atomic state in the configuration, walk outward through its proper
/// ancestors collecting transitions with no `event` attribute, and select
/// the first one (in that state/ancestor, then document, order) whose `cond`
/// evaluates true.
fn select_eventless_transitions(session: &mut Session) -> Vec<TransitionId> {
    let document = session.document.clone();
    let mut atomic_states: Vec<StateId> = session
        .configuration
        .iter()
        .copied()
        .filter(|sid| document.state(*sid).is_atomic())
        .collect();
    atomic_states.sort_by(|a, b| document.document_order(*a, *b));

    let mut enabled: Vec<TransitionId> = Vec::new();
    for sid in atomic_states {
        let mut chain = vec![sid];
        chain.extend(document.ancestors(sid));
        let mut candidates: Vec<TransitionId> = Vec::new();
        for s in &chain {
            let mut ts = document.state(*s).transitions.clone();
            ts.sort_by(|a, b| document.transition_document_order(*a, *b));
            candidates.extend(ts.into_iter().filter(|t| document.transition(*t).is_eventless));
        }
        for t in candidates {
            if condition_match(session, t) {
                if !enabled.contains(&t) {
                    enabled.push(t);
                }
                break;
            }
        }
    }
    remove_conflicting_transitions(session, enabled)
}

/// *W3C says* (§3.2 "function selectTransitions(event)"): same search as
/// `selectEventlessTransitions`, but a candidate must also have an `event`
/// descriptor matching `event.name`.
fn select_transitions(session: &mut Session, event: &Event) -> Vec<TransitionId> {
    let document = session.document.clone();
    let mut atomic_states: Vec<StateId> = session
        .configuration
        .iter()
        .copied()
        .filter(|sid| document.state(*sid).is_atomic())
        .collect();
    atomic_states.sort_by(|a, b| document.document_order(*a, *b));

    let mut enabled: Vec<TransitionId> = Vec::new();
    for sid in atomic_states {
        let mut chain = vec![sid];
        chain.extend(document.ancestors(sid));
        let found = 'outer: loop {
            for s in &chain {
                let mut ts = document.state(*s).transitions.clone();
                ts.sort_by(|a, b| document.transition_document_order(*a, *b));
                for t in ts {
                    if document.transition(t).matches_event(&event.name) && condition_match(session, t) {
                        break 'outer Some(t);
                    }
                }
            }
            break 'outer None;
        };
        if let Some(t) = found {
            if !enabled.contains(&t) {
                enabled.push(t);
            }
        }
    }
    remove_conflicting_transitions(session, enabled)
}

fn condition_match(session: &mut Session, tid: TransitionId) -> bool {
    let document = session.document.clone();
    let cond = document.transition(tid).cond.clone();
    match cond {
        None => true,
        Some(expr) => {
            let (datamodel, mut sink) = session.split_for_execution();
            match datamodel.evaluate_condition(&expr) {
                Ok(v) => v,
                Err(e) => {
                    warn!("transition cond '{}' failed: {}", expr, e);
                    sink.raise_error_execution();
                    false
                }
            }
        }
    }
}

/// *W3C says* (§3.2 "function removeConflictingTransitions(enabledTransitions)"):
/// a later transition preempts an earlier one if their exit sets intersect
/// and the earlier one is not a proper-descendant-sourced transition of the
/// later (in which case the later is dropped instead).
fn remove_conflicting_transitions(session: &mut Session, enabled: Vec<TransitionId>) -> Vec<TransitionId> {
    let document = session.document.clone();
    let mut filtered: Vec<TransitionId> = Vec::new();
    for t1 in enabled {
        let exit1 = compute_exit_set(&document, &session.configuration, &session.history, &[t1]);
        let mut preempted = false;
        let mut to_remove: Vec<TransitionId> = Vec::new();
        for &t2 in &filtered {
            let exit2 = compute_exit_set(&document, &session.configuration, &session.history, &[t2]);
            if exit1.iter().any(|s| exit2.contains(s)) {
                if document.is_descendant(document.transition(t1).source, document.transition(t2).source) {
                    to_remove.push(t2);
                } else {
                    preempted = true;
                    break;
                }
            }
        }
        if !preempted {
            filtered.retain(|t| !to_remove.contains(t));
            if !filtered.contains(&t1) {
                filtered.push(t1);
            }
        }
    }
    filtered
}

/// *W3C says* (§3.2 "procedure microstep(enabledTransitions)"): exit states,
/// run transition content, enter states — one indivisible step.
fn microstep(session: &mut Session, enabled: &[TransitionId]) {
    let document = session.document.clone();
    exit_states(session, enabled);
    execute_transition_content(session, &document, enabled);
    enter_states(session, enabled);
}

/// *W3C says* (§3.2 "procedure exitStates(enabledTransitions)"): compute the
/// exit set, record shallow/deep history for any `<history>` children of the
/// states about to be exited, then run `onexit` and cancel invokes in
/// reverse document order.
fn exit_states(session: &mut Session, enabled: &[TransitionId]) {
    let document = session.document.clone();
    let states_to_exit = compute_exit_set(&document, &session.configuration, &session.history, enabled);
    session.states_to_invoke.retain(|s| !states_to_exit.contains(s));

    for &s in &states_to_exit {
        for &h in &document.state(s).children.clone() {
            if document.state(h).is_history() {
                let deep = document.state(h).history_type == HistoryType::Deep;
                let recorded: Vec<StateId> = session
                    .configuration
                    .iter()
                    .copied()
                    .filter(|s0| {
                        if deep {
                            document.state(*s0).is_atomic() && document.is_descendant(*s0, s)
                        } else {
                            document.state(*s0).parent == s
                        }
                    })
                    .collect();
                session.history.record(h, recorded);
            }
        }
    }

    let mut ordered = states_to_exit;
    ordered.sort_by(|a, b| document.document_order(*b, *a));

    for s in ordered {
        session.set_current_state_for_ids(Some(s));
        session.tracer.trace(TraceRecord::StateExited(s));
        for cid in document.state(s).onexit.clone() {
            execute_content_id(session, &document, cid);
        }
        let invoke_ids = session.invokes.owned_by(s);
        for id in invoke_ids {
            cancel_invoke(session, &id);
        }
        session.configuration.retain(|c| *c != s);
        let configuration = session.configuration.clone();
        let (datamodel, _sink) = session.split_for_execution();
        datamodel.sync_configuration(&configuration);
    }
}

fn execute_transition_content(session: &mut Session, document: &Document, enabled: &[TransitionId]) {
    for &t in enabled {
        session.tracer.trace(TraceRecord::TransitionTaken(t));
        session.set_current_state_for_ids(Some(document.transition(t).source));
        for cid in document.transition(t).content.clone() {
            execute_content_id(session, document, cid);
        }
    }
}

/// *W3C says* (§3.2 "procedure enterStates(enabledTransitions)"): compute the
/// entry set, enter every state in document order, run `onentry` plus any
/// default-initial/default-history content, initialize late-bound data on
/// first entry, and generate `done.state.*` events for newly entered final
/// states.
fn enter_states(session: &mut Session, enabled: &[TransitionId]) {
    let document = session.document.clone();
    let ec = compute_entry_set(&document, &session.history, enabled);
    let mut ordered = ec.states_to_enter.clone();
    ordered.sort_by(|a, b| document.document_order(*a, *b));

    for s in ordered {
        if !session.configuration.contains(&s) {
            session.configuration.push(s);
        }
        if !session.states_to_invoke.contains(&s) {
            session.states_to_invoke.push(s);
        }
        session.set_current_state_for_ids(Some(s));
        session.tracer.trace(TraceRecord::StateEntered(s));
        {
            let configuration = session.configuration.clone();
            let (datamodel, _sink) = session.split_for_execution();
            datamodel.sync_configuration(&configuration);
        }

        if document.binding == BindingType::Late && !session.is_data_initialized(s) {
            session.mark_data_initialized(s);
            let (datamodel, mut sink) = session.split_for_execution();
            for _ in datamodel.initialize_data(&document, s) {
                sink.raise_error_execution();
            }
        }

        for cid in document.state(s).onentry.clone() {
            execute_content_id(session, &document, cid);
        }

        if ec.states_for_default_entry.contains(&s) {
            let init_t = document.state(s).initial_transition;
            if init_t != NONE {
                for cid in document.transition(init_t).content.clone() {
                    execute_content_id(session, &document, cid);
                }
            }
        }

        if let Some(cids) = ec.default_history_content.get(&s).cloned() {
            for cid in cids {
                execute_content_id(session, &document, cid);
            }
        }

        if document.state(s).is_final {
            let parent = document.state(s).parent;
            if parent == document.root {
                session.running = false;
            } else {
                let donedata = evaluate_donedata(session, &document, s);
                let parent_name = document.state(parent).name.clone();
                {
                    let (_datamodel, mut sink) = session.split_for_execution();
                    sink.raise_internal(Event::done_state(&parent_name, donedata));
                }
                let grandparent = document.state(parent).parent;
                if grandparent != NONE && document.state(grandparent).is_parallel {
                    let all_final = document
                        .state(grandparent)
                        .children
                        .iter()
                        .all(|c| is_in_final_state(&document, &session.configuration, *c));
                    if all_final {
                        let grandparent_name = document.state(grandparent).name.clone();
                        let (_datamodel, mut sink) = session.split_for_execution();
                        sink.raise_internal(Event::done_state(&grandparent_name, None));
                    }
                }
            }
        }
    }
}

fn evaluate_donedata(session: &mut Session, document: &Document, state: StateId) -> Option<Data> {
    let donedata = document.state(state).donedata.clone()?;
    let (datamodel, mut sink) = session.split_for_execution();
    if let Some(expr) = &donedata.content_expr {
        match datamodel.evaluate(expr) {
            Ok(v) => Some(Data::String(v)),
            Err(e) => {
                warn!("donedata content failed: {}", e);
                sink.raise_error_execution();
                None
            }
        }
    } else if !donedata.params.is_empty() {
        let mut map = HashMap::new();
        for p in &donedata.params {
            let value = if let Some(loc) = &p.location {
                datamodel.get_by_location(loc)
            } else if let Some(expr) = &p.expr {
                datamodel.evaluate(expr).map(Data::String)
            } else {
                Ok(Data::Null)
            };
            match value {
                Ok(v) => {
                    map.insert(p.name.clone(), v);
                }
                Err(e) => {
                    warn!("donedata param '{}' failed: {}", p.name, e);
                    sink.raise_error_execution();
                }
            }
        }
        Some(Data::Map(map))
    } else {
        None
    }
}

fn execute_content_id(session: &mut Session, document: &Document, cid: ExecutableContentId) {
    if cid == NONE {
        return;
    }
    let (datamodel, mut sink) = session.split_for_execution();
    executable_content::execute_block(document.content(cid), document, datamodel, &mut sink);
}

fn proper_ancestors(document: &Document, state: StateId, stop: StateId) -> Vec<StateId> {
    let mut out = Vec::new();
    let mut cur = document.state(state).parent;
    while cur != NONE && cur != stop {
        out.push(cur);
        cur = document.state(cur).parent;
    }
    out
}

fn is_in_final_state(document: &Document, configuration: &[StateId], state: StateId) -> bool {
    let st = document.state(state);
    if st.is_compound() {
        st.children
            .iter()
            .any(|c| document.state(*c).is_final && configuration.contains(c))
    } else if st.is_parallel {
        st.children.iter().all(|c| is_in_final_state(document, configuration, *c))
    } else {
        false
    }
}

/// *W3C says* (§3.2 "function getEffectiveTargetStates(transition)"):
/// dereferences any `<history>` targets to their recorded value (or, if
/// never recorded, the history pseudo-state's own default transition).
fn effective_target_states(document: &Document, history: &HistoryStore, tid: TransitionId) -> Vec<StateId> {
    let mut targets: Vec<StateId> = Vec::new();
    for &s in &document.transition(tid).target {
        if document.state(s).is_history() {
            if let Some(recorded) = history.get(s) {
                for &r in recorded {
                    if !targets.contains(&r) {
                        targets.push(r);
                    }
                }
            } else {
                let init_t = document.state(s).initial_transition;
                if init_t != NONE {
                    for r in effective_target_states(document, history, init_t) {
                        if !targets.contains(&r) {
                            targets.push(r);
                        }
                    }
                }
            }
        } else if !targets.contains(&s) {
            targets.push(s);
        }
    }
    targets
}

/// *W3C says* (§3.2 "function getTransitionDomain(t)"): the compound state
/// such that every state entered/exited by `t` is a descendant of it, and no
/// descendant of it shares that property.
fn get_transition_domain(document: &Document, history: &HistoryStore, tid: TransitionId) -> StateId {
    let tstates = effective_target_states(document, history, tid);
    if tstates.is_empty() {
        return NONE;
    }
    let t = document.transition(tid);
    if t.transition_type == TransitionType::Internal
        && document.state(t.source).is_compound()
        && tstates.iter().all(|s| document.is_descendant(*s, t.source))
    {
        t.source
    } else {
        let mut list = vec![t.source];
        list.extend(tstates);
        document.find_lcca(&list)
    }
}

/// *W3C says* (§3.2 "function computeExitSet(transitions)"): every
/// configuration member that is a descendant of the transition's domain.
fn compute_exit_set(
    document: &Document,
    configuration: &[StateId],
    history: &HistoryStore,
    transitions: &[TransitionId],
) -> Vec<StateId> {
    let mut states: Vec<StateId> = Vec::new();
    for &t in transitions {
        if !document.transition(t).target.is_empty() {
            let domain = get_transition_domain(document, history, t);
            if domain != NONE {
                for &sid in configuration {
                    if document.is_descendant(sid, domain) && !states.contains(&sid) {
                        states.push(sid);
                    }
                }
            }
        }
    }
    states
}

/// Accumulator threaded through `compute_entry_set`/`add_descendant_states_to_enter`/
/// `add_ancestor_states_to_enter`, matching the three out-parameters the W3C
/// pseudocode passes by reference.
#[derive(Default)]
struct EntrySet {
    states_to_enter: Vec<StateId>,
    states_for_default_entry: Vec<StateId>,
    default_history_content: HashMap<StateId, Vec<ExecutableContentId>>,
}

/// *W3C says* (§3.2 "procedure computeEntrySet(transitions, ...)").
fn compute_entry_set(document: &Document, history: &HistoryStore, transitions: &[TransitionId]) -> EntrySet {
    let mut entry = EntrySet::default();
    for &t in transitions {
        for &s in &document.transition(t).target {
            add_descendant_states_to_enter(document, history, s, &mut entry);
        }
        let ancestor = get_transition_domain(document, history, t);
        for s in effective_target_states(document, history, t) {
            add_ancestor_states_to_enter(document, history, s, ancestor, &mut entry);
        }
    }
    entry
}

/// *W3C says* (§3.2 "procedure addDescendantStatesToEnter(state, ...)").
fn add_descendant_states_to_enter(document: &Document, history: &HistoryStore, state: StateId, entry: &mut EntrySet) {
    if document.state(state).is_history() {
        let parent = document.state(state).parent;
        if let Some(recorded) = history.get(state) {
            let recorded = recorded.to_vec();
            for &s in &recorded {
                add_descendant_states_to_enter(document, history, s, entry);
            }
            for &s in &recorded {
                add_ancestor_states_to_enter(document, history, s, parent, entry);
            }
        } else {
            let init_t = document.state(state).initial_transition;
            if init_t != NONE {
                entry
                    .default_history_content
                    .insert(parent, document.transition(init_t).content.clone());
                let targets = document.transition(init_t).target.clone();
                for &s in &targets {
                    add_descendant_states_to_enter(document, history, s, entry);
                }
                for &s in &targets {
                    add_ancestor_states_to_enter(document, history, s, parent, entry);
                }
            }
        }
        return;
    }

    if !entry.states_to_enter.contains(&state) {
        entry.states_to_enter.push(state);
    }

    if document.state(state).is_compound() {
        if !entry.states_for_default_entry.contains(&state) {
            entry.states_for_default_entry.push(state);
        }
        let init_t = document.state(state).initial_transition;
        if init_t != NONE {
            let targets = document.transition(init_t).target.clone();
            for &s in &targets {
                add_descendant_states_to_enter(document, history, s, entry);
            }
            for &s in &targets {
                add_ancestor_states_to_enter(document, history, s, state, entry);
            }
        }
    } else if document.state(state).is_parallel {
        for &child in &document.state(state).children.clone() {
            if !entry
                .states_to_enter
                .iter()
                .any(|s| *s == child || document.is_descendant(*s, child))
            {
                add_descendant_states_to_enter(document, history, child, entry);
            }
        }
    }
}

/// *W3C says* (§3.2 "procedure addAncestorStatesToEnter(state, ancestor, ...)").
fn add_ancestor_states_to_enter(
    document: &Document,
    history: &HistoryStore,
    state: StateId,
    ancestor: StateId,
    entry: &mut EntrySet,
) {
    for anc in proper_ancestors(document, state, ancestor) {
        if !entry.states_to_enter.contains(&anc) {
            entry.states_to_enter.push(anc);
        }
        if document.state(anc).is_parallel {
            for &child in &document.state(anc).children.clone() {
                if !entry
                    .states_to_enter
                    .iter()
                    .any(|s| *s == child || document.is_descendant(*s, child))
                {
                    add_descendant_states_to_enter(document, history, child, entry);
                }
            }
        }
    }
}

/// Runs every `<invoke>` declared on a state entered during the macrostep
/// that just completed, in entry order then document order per state (spec
/// §4.4 `mainEventLoop` step 2). Unsupported `type`/evaluation failures are
/// reported as `error.execution` per W3C 6.4, and the invoke is skipped.
fn run_pending_invokes(session: &mut Session) {
    if session.states_to_invoke.is_empty() {
        return;
    }
    let document = session.document.clone();
    let mut states = std::mem::take(&mut session.states_to_invoke);
    states.sort_by(|a, b| document.document_order(*a, *b));

    for state in states {
        let mut decls = document.state(state).invoke.clone();
        decls.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        for decl in decls {
            invoke_one(session, &document, state, &decl);
        }
    }
}

fn invoke_one(session: &mut Session, document: &Document, owner_state: StateId, decl: &InvokeDecl) {
    let host = match session.invoke_host.clone() {
        Some(host) => host,
        None => {
            warn!("<invoke> ignored: no invoke host configured for this session");
            return;
        }
    };

    let type_name = match resolve_expr(session, decl.type_name.as_deref(), decl.type_expr.as_deref()) {
        Ok(v) => v.unwrap_or_else(|| crate::data_model::SCXML_EVENT_PROCESSOR.to_string()),
        Err(_) => return,
    };

    let src = match resolve_expr(session, decl.src.as_deref(), decl.src_expr.as_deref()) {
        Ok(v) => v,
        Err(_) => return,
    };

    session.set_current_state_for_ids(Some(owner_state));
    let invoke_id = match &decl.id {
        Some(id) => id.clone(),
        None => {
            let (_datamodel, mut sink) = session.split_for_execution();
            sink.generate_send_id()
        }
    };
    if let Some(location) = &decl.id_location {
        let (datamodel, mut sink) = session.split_for_execution();
        if let Err(e) = datamodel.assign(location, &format!("'{}'", invoke_id)) {
            warn!("invoke idlocation '{}' failed: {}", location, e);
            sink.raise_error_execution();
            return;
        }
    }

    let mut params = ParamValues::new();
    {
        let (datamodel, mut sink) = session.split_for_execution();
        for name in &decl.name_list {
            match datamodel.get_by_location(name) {
                Ok(value) => {
                    params.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!("invoke namelist '{}' failed: {}", name, e);
                    sink.raise_error_execution();
                    return;
                }
            }
        }
        for p in &decl.params {
            let value = if let Some(loc) = &p.location {
                datamodel.get_by_location(loc)
            } else if let Some(expr) = &p.expr {
                datamodel.evaluate(expr).map(Data::String)
            } else {
                Ok(Data::Null)
            };
            match value {
                Ok(v) => {
                    params.insert(p.name.clone(), v);
                }
                Err(e) => {
                    warn!("invoke param '{}' failed: {}", p.name, e);
                    sink.raise_error_execution();
                    return;
                }
            }
        }
    }

    // A nested `<content>` document (e.g. `<scxml>...</scxml>`) is handed to
    // the invoke host verbatim — it names a child document, not a value the
    // data model can evaluate. Only a scalar `<content expr="...">`/text
    // falls back to evaluation.
    let content = match (&decl.content_doc, &decl.content_expr) {
        (Some(doc), _) => Some(doc.clone()),
        (None, Some(expr)) => {
            let (datamodel, mut sink) = session.split_for_execution();
            match datamodel.evaluate(expr) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("invoke content failed: {}", e);
                    sink.raise_error_execution();
                    return;
                }
            }
        }
        (None, None) => None,
    };

    debug!(
        "invoke: type '{}' id '{}' src {:?} params {:?}",
        type_name, invoke_id, src, params
    );

    match host.start(session.id, &invoke_id, &type_name, src.as_deref(), content.as_deref(), &params) {
        Ok(child) => {
            session.invokes.insert(InvocationRecord {
                invoke_id,
                owner_state,
                child_session: child,
                autoforward: decl.autoforward,
            });
        }
        Err(e) => {
            warn!("invoke '{}' failed to start: {}", invoke_id, e);
            let (_datamodel, mut sink) = session.split_for_execution();
            sink.raise_error_communication(None, Some(invoke_id));
        }
    }
}

fn resolve_expr(session: &mut Session, literal: Option<&str>, expr: Option<&str>) -> Result<Option<String>, ()> {
    match (literal, expr) {
        (Some(l), _) => Ok(Some(l.to_string())),
        (None, Some(e)) => {
            let (datamodel, mut sink) = session.split_for_execution();
            match datamodel.evaluate(e) {
                Ok(v) => Ok(Some(v)),
                Err(err) => {
                    warn!("invoke expression '{}' failed: {}", e, err);
                    sink.raise_error_execution();
                    Err(())
                }
            }
        }
        (None, None) => Ok(None),
    }
}

/// Cancels a running invocation: tells the host to terminate the child
/// session and forgets the bookkeeping (spec §4.6 SUPPLEMENT).
fn cancel_invoke(session: &mut Session, invoke_id: &InvokeId) {
    if let Some(record) = session.invokes.remove(invoke_id) {
        if let Some(host) = session.invoke_host.clone() {
            host.cancel(record.child_session);
        }
        session.registry.forget_invocation(invoke_id);
        session.registry.deregister(record.child_session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::NullDatamodel;
    use crate::model::{DataSpec, DocumentBuilder, HistoryType, InvokeDecl, ParamSpec, State, Transition, TransitionType};
    use crate::registry::Registry;
    use crate::scheduler::Scheduler;
    use crate::tracer::NullTracer;
    use std::sync::mpsc::channel;

    fn leaf(name: &str, parent: StateId, doc_id: u32) -> State {
        State {
            id: 0,
            doc_id,
            name: name.to_string(),
            parent,
            children: vec![],
            is_parallel: false,
            is_final: false,
            history_type: HistoryType::None,
            initial_transition: NONE,
            transitions: vec![],
            onentry: vec![],
            onexit: vec![],
            invoke: vec![],
            datamodel: vec![],
            donedata: None,
        }
    }

    fn new_session(document: Arc<Document>) -> Session {
        let (_tx, rx) = channel();
        Session::new(
            1,
            "test".to_string(),
            document,
            Box::new(NullDatamodel::new()),
            rx,
            Box::new(NullTracer::default()),
            Arc::new(Scheduler::new()),
            Registry::new(),
            "t".to_string(),
        )
    }

    /// a -> b on event "go"; entering b's compound child is reached via the
    /// initial transition chain covered by `enter_states`/`compute_entry_set`.
    #[test]
    fn simple_transition_moves_configuration() {
        let mut b = DocumentBuilder::new();
        let root = b.add_state(leaf("scxml", NONE, 1));
        let a = b.add_state(leaf("a", root, 2));
        let bb = b.add_state(leaf("b", root, 3));
        b.state_mut(root).children.push(a);
        b.state_mut(root).children.push(bb);

        let t = b.add_transition(Transition {
            id: 0,
            doc_id: 10,
            source: a,
            events: vec!["go".to_string()],
            is_eventless: false,
            cond: None,
            target: vec![bb],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(a).transitions.push(t);

        let init_t = b.add_transition(Transition {
            id: 0,
            doc_id: 0,
            source: root,
            events: vec![],
            is_eventless: true,
            cond: None,
            target: vec![a],
            transition_type: TransitionType::External,
            content: vec![],
        });

        let document = Arc::new(b.build(root, init_t).unwrap());
        let mut session = new_session(document);
        initialize(&mut session);
        assert!(session.configuration.contains(&a));

        let enabled = select_transitions(&mut session, &Event::external("go"));
        assert_eq!(enabled, vec![t]);
        microstep(&mut session, &enabled);
        assert!(session.configuration.contains(&bb));
        assert!(!session.configuration.contains(&a));
    }

    #[test]
    fn entering_top_level_final_state_stops_running() {
        let mut b = DocumentBuilder::new();
        let root = b.add_state(leaf("scxml", NONE, 1));
        let mut fin = leaf("done", root, 2);
        fin.is_final = true;
        let fin_id = b.add_state(fin);
        b.state_mut(root).children.push(fin_id);

        let init_t = b.add_transition(Transition {
            id: 0,
            doc_id: 0,
            source: root,
            events: vec![],
            is_eventless: true,
            cond: None,
            target: vec![fin_id],
            transition_type: TransitionType::External,
            content: vec![],
        });

        let document = Arc::new(b.build(root, init_t).unwrap());
        let mut session = new_session(document);
        initialize(&mut session);
        assert!(!session.running);
    }

    #[test]
    fn shallow_history_restores_last_active_child() {
        let mut b = DocumentBuilder::new();
        let root = b.add_state(leaf("scxml", NONE, 1));
        let compound = b.add_state(leaf("compound", root, 2));
        let s1 = b.add_state(leaf("s1", compound, 3));
        let s2 = b.add_state(leaf("s2", compound, 4));
        let mut hist = leaf("h", compound, 5);
        hist.history_type = HistoryType::Shallow;
        let hist_id = b.add_state(hist);
        let outside = b.add_state(leaf("outside", root, 6));

        b.state_mut(root).children.push(compound);
        b.state_mut(root).children.push(outside);
        b.state_mut(compound).children.push(s1);
        b.state_mut(compound).children.push(s2);
        b.state_mut(compound).children.push(hist_id);

        let compound_init = b.add_transition(Transition {
            id: 0,
            doc_id: 0,
            source: compound,
            events: vec![],
            is_eventless: true,
            cond: None,
            target: vec![s1],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(compound).initial_transition = compound_init;
        let hist_default = b.add_transition(Transition {
            id: 0,
            doc_id: 0,
            source: hist_id,
            events: vec![],
            is_eventless: true,
            cond: None,
            target: vec![s1],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(hist_id).initial_transition = hist_default;

        let to_s2 = b.add_transition(Transition {
            id: 0,
            doc_id: 10,
            source: s1,
            events: vec!["next".to_string()],
            is_eventless: false,
            cond: None,
            target: vec![s2],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(s1).transitions.push(to_s2);

        let leave = b.add_transition(Transition {
            id: 0,
            doc_id: 11,
            source: compound,
            events: vec!["leave".to_string()],
            is_eventless: false,
            cond: None,
            target: vec![outside],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(compound).transitions.push(leave);

        let back = b.add_transition(Transition {
            id: 0,
            doc_id: 12,
            source: outside,
            events: vec!["back".to_string()],
            is_eventless: false,
            cond: None,
            target: vec![hist_id],
            transition_type: TransitionType::External,
            content: vec![],
        });
        b.state_mut(outside).transitions.push(back);

        let init_t = b.add_transition(Transition {
            id: 0,
            doc_id: 0,
            source: root,
            events: vec![],
            is_eventless: true,
            cond: None,
            target: vec![compound],
            transition_type: TransitionType::External,
            content: vec![],
        });

        let document = Arc::new(b.build(root, init_t).unwrap());
        let mut session = new_session(document);
        initialize(&mut session);
        assert!(session.configuration.contains(&s1));

        let enabled = select_transitions(&mut session, &Event::external("next"));
        microstep(&mut session, &enabled);
        assert!(session.configuration.contains(&s2));

        let enabled = select_transitions(&mut session, &Event::external("leave"));
        microstep(&mut session, &enabled);
        assert!(session.configuration.contains(&outside));
        assert!(!session.configuration.contains(&s2));

        let enabled = select_transitions(&mut session, &Event::external("back"));
        microstep(&mut session, &enabled);
        assert!(session.configuration.contains(&s2));
        assert!(!session.configuration.contains(&s1));
    }

    #[test]
    fn donedata_params_unused_imports_stay_referenced() {
        let _ = ParamSpec {
            name: "x".to_string(),
            location: None,
            expr: None,
        };
        let _ = DataSpec {
            id: "x".to_string(),
            expr: None,
            literal: None,
            src: None,
        };
        let _: Option<InvokeDecl> = None;
    }
}
