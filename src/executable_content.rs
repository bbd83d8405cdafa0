//! Executable Content Engine (spec §4.3): `Action` is a tagged enum (§9
//! redesign note — no virtual dispatch, no `downcast` juggling) and
//! `execute_block` is the single interpreter function that runs a slice of
//! actions, halting on the first failure per the W3C block-execution rule.
//!
//! Actions never talk to the Scheduler or Session Registry directly — they
//! write to an `ActionSink`, which the caller (the interpreter, driving a
//! live `Session`) drains afterwards. This keeps the engine testable with a
//! bare `Datamodel` and no running session.

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::data_model::Data;
use crate::event::{Event, ParamValues, SendId};
use crate::model::{Document, ExecutableContentId, ParamSpec};
use crate::{data_model::Datamodel, event::InvokeId};

#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: String,
    pub content: ExecutableContentId,
}

#[derive(Debug, Clone, Default)]
pub struct SendAction {
    pub id: Option<String>,
    pub id_location: Option<String>,
    pub event: Option<String>,
    pub event_expr: Option<String>,
    pub target: Option<String>,
    pub target_expr: Option<String>,
    pub type_name: Option<String>,
    pub type_expr: Option<String>,
    pub delay: Option<String>,
    pub delay_expr: Option<String>,
    pub name_list: Vec<String>,
    pub params: Vec<ParamSpec>,
    pub content_expr: Option<String>,
}

/// One piece of executable content. Blocks (`<if>`/`<foreach>` bodies) are
/// referenced by `ExecutableContentId` into the owning `Document`'s content
/// arena, never inlined, so the arena stays the single source of truth for
/// document order and size.
#[derive(Debug, Clone)]
pub enum Action {
    Raise {
        event: String,
    },
    Assign {
        location: String,
        expr: String,
    },
    Script {
        body: String,
    },
    Log {
        label: Option<String>,
        expr: String,
    },
    If {
        branches: Vec<IfBranch>,
        else_content: ExecutableContentId,
    },
    Foreach {
        array: String,
        item: String,
        index: Option<String>,
        content: ExecutableContentId,
    },
    Send(SendAction),
    Cancel {
        send_id: Option<String>,
        send_id_expr: Option<String>,
    },
}

/// Everything a `<send>` needs forwarded to the Scheduler (§4.5) to be
/// dispatched now or after `delay_ms`.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub send_id: SendId,
    pub target: String,
    pub event_name: String,
    pub type_uri: String,
    pub delay_ms: i64,
    pub params: ParamValues,
    pub content: Option<Data>,
}

/// Side effects produced while running a block, applied by the caller once
/// the block finishes (or halts).
pub trait ActionSink {
    fn raise_internal(&mut self, event: Event);
    fn log(&mut self, label: Option<&str>, message: &str);
    fn send(&mut self, req: SendRequest);
    fn cancel(&mut self, send_id: &str);
    fn raise_error_execution(&mut self);
    fn raise_error_communication(&mut self, send_id: Option<SendId>, invoke_id: Option<InvokeId>);
    /// Mints a fresh `<stateid>.<platformid>.<index>`-shaped send id (spec
    /// §3.2), used whenever `<send>` omits both `id` and `idlocation`, or
    /// needs one to write into `idlocation`.
    fn generate_send_id(&mut self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    Failed,
}

/// *W3C says* (4.3 Executable Content): "If any evaluation failures occur
/// while executing [a block], the Processor must place error.execution on
/// the internal event queue... and stop executing further elements in the
/// block." One halting function implements that rule for every caller
/// (`<onentry>`, `<onexit>`, `<transition>` content, `<if>`/`<foreach>`
/// bodies, `<invoke>` `<finalize>`).
pub fn execute_block(
    actions: &[Action],
    document: &Document,
    datamodel: &mut dyn Datamodel,
    sink: &mut dyn ActionSink,
) -> ActionOutcome {
    for action in actions {
        if execute_one(action, document, datamodel, sink) == ActionOutcome::Failed {
            return ActionOutcome::Failed;
        }
    }
    ActionOutcome::Completed
}

fn execute_one(
    action: &Action,
    document: &Document,
    datamodel: &mut dyn Datamodel,
    sink: &mut dyn ActionSink,
) -> ActionOutcome {
    match action {
        Action::Raise { event } => {
            sink.raise_internal(Event::internal(event.clone()));
            ActionOutcome::Completed
        }
        Action::Assign { location, expr } => match datamodel.assign(location, expr) {
            Ok(()) => ActionOutcome::Completed,
            Err(e) => {
                warn!("assign '{}' = '{}' failed: {}", location, expr, e);
                sink.raise_error_execution();
                ActionOutcome::Failed
            }
        },
        Action::Script { body } => match datamodel.execute_script(body) {
            Ok(()) => ActionOutcome::Completed,
            Err(e) => {
                warn!("script execution failed: {}", e);
                sink.raise_error_execution();
                ActionOutcome::Failed
            }
        },
        Action::Log { label, expr } => match datamodel.evaluate(expr) {
            Ok(message) => {
                sink.log(label.as_deref(), &message);
                ActionOutcome::Completed
            }
            Err(e) => {
                warn!("log expression '{}' failed: {}", expr, e);
                sink.raise_error_execution();
                ActionOutcome::Failed
            }
        },
        Action::If {
            branches,
            else_content,
        } => execute_if(branches, *else_content, document, datamodel, sink),
        Action::Foreach {
            array,
            item,
            index,
            content,
        } => execute_foreach(array, item, index.as_deref(), *content, document, datamodel, sink),
        Action::Send(send) => execute_send(send, datamodel, sink),
        Action::Cancel {
            send_id,
            send_id_expr,
        } => execute_cancel(send_id.as_deref(), send_id_expr.as_deref(), datamodel, sink),
    }
}

fn execute_if(
    branches: &[IfBranch],
    else_content: ExecutableContentId,
    document: &Document,
    datamodel: &mut dyn Datamodel,
    sink: &mut dyn ActionSink,
) -> ActionOutcome {
    for branch in branches {
        match datamodel.evaluate_condition(&branch.cond) {
            Ok(true) => return execute_block(document.content(branch.content), document, datamodel, sink),
            Ok(false) => continue,
            Err(e) => {
                warn!("condition '{}' can't be evaluated: {}", branch.cond, e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        }
    }
    if else_content != crate::model::NONE {
        execute_block(document.content(else_content), document, datamodel, sink)
    } else {
        ActionOutcome::Completed
    }
}

/// *W3C says* (4.6 `<foreach>`): "the Processor MUST create a shallow copy
/// of the collection... changes to the collection during the execution of
/// the block must not affect the iteration." `foreach_snapshot` takes that
/// copy before the first iteration runs.
fn execute_foreach(
    array: &str,
    item: &str,
    index: Option<&str>,
    content: ExecutableContentId,
    document: &Document,
    datamodel: &mut dyn Datamodel,
    sink: &mut dyn ActionSink,
) -> ActionOutcome {
    let snapshot = match datamodel.foreach_snapshot(array) {
        Ok(values) => values,
        Err(e) => {
            warn!("foreach array '{}' can't be evaluated: {}", array, e);
            sink.raise_error_execution();
            return ActionOutcome::Failed;
        }
    };
    for (idx, value) in snapshot.iter().enumerate() {
        if let Err(e) = datamodel.foreach_bind(item, index, value, idx) {
            warn!("foreach binding failed: {}", e);
            sink.raise_error_execution();
            return ActionOutcome::Failed;
        }
        if execute_block(document.content(content), document, datamodel, sink) == ActionOutcome::Failed {
            return ActionOutcome::Failed;
        }
    }
    ActionOutcome::Completed
}

fn resolve(expr: Option<&str>, expr_alt: Option<&str>, datamodel: &mut dyn Datamodel) -> Result<Option<String>, String> {
    match (expr, expr_alt) {
        (Some(literal), _) => Ok(Some(literal.to_string())),
        (None, Some(e)) => datamodel.evaluate(e).map(Some),
        (None, None) => Ok(None),
    }
}

fn execute_send(send: &SendAction, datamodel: &mut dyn Datamodel, sink: &mut dyn ActionSink) -> ActionOutcome {
    let send_id = match &send.id {
        Some(id) => id.clone(),
        None => {
            let generated = sink.generate_send_id();
            if let Some(location) = &send.id_location {
                if let Err(e) = datamodel.assign(location, &format!("'{}'", generated)) {
                    warn!("send idlocation '{}' failed: {}", location, e);
                    sink.raise_error_execution();
                    return ActionOutcome::Failed;
                }
            }
            generated
        }
    };

    let mut type_uri = match resolve(send.type_name.as_deref(), send.type_expr.as_deref(), datamodel) {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => {
            warn!("send typeexpr failed: {}", e);
            sink.raise_error_execution();
            return ActionOutcome::Failed;
        }
    };
    if type_uri.is_empty() {
        type_uri = crate::data_model::SCXML_EVENT_PROCESSOR.to_string();
    }
    let type_is_basic_http = type_uri == crate::data_model::BASIC_HTTP_EVENT_PROCESSOR || type_uri == "basichttp";
    // *W3C says* (6.2.4 step 1 of the SPEC_FULL send validation order):
    // unsupported `type` is a synchronous `error.execution`, checked before
    // any target resolution runs.
    let type_supported = type_uri == crate::data_model::SCXML_EVENT_PROCESSOR
        || type_uri == "scxml"
        || (cfg!(feature = "basic-http") && type_is_basic_http);
    if !type_supported {
        warn!("send: unsupported type '{}'", type_uri);
        sink.raise_error_execution();
        return ActionOutcome::Failed;
    }

    let target_expr_used = send.target.is_none() && send.target_expr.is_some();
    let target = match resolve(send.target.as_deref(), send.target_expr.as_deref(), datamodel) {
        Ok(v) => v,
        Err(e) => {
            warn!("send targetexpr failed: {}", e);
            sink.raise_error_execution();
            return ActionOutcome::Failed;
        }
    };
    if target.as_deref().is_some_and(|t| t.starts_with('!')) {
        warn!("send: target '{}' is not a valid IRI", target.as_deref().unwrap_or(""));
        sink.raise_error_execution();
        return ActionOutcome::Failed;
    }
    // step 3: an evaluated targetexpr that comes back empty/"undefined" means
    // the peer it pointed at is unreachable, distinct from no target
    // attribute at all (which routes locally, spec §6.5).
    if target_expr_used && matches!(target.as_deref(), None | Some("") | Some("undefined")) {
        warn!("send: targetexpr evaluated to an unreachable target");
        sink.raise_error_communication(Some(send_id), None);
        return ActionOutcome::Failed;
    }
    let target = target.unwrap_or_default();
    // step 4: types that can only ever reach a target (no implicit local
    // route) need one.
    if type_is_basic_http && target.is_empty() {
        warn!("send: type '{}' requires a target", type_uri);
        sink.raise_error_communication(Some(send_id), None);
        return ActionOutcome::Failed;
    }

    let event_name = match resolve(send.event.as_deref(), send.event_expr.as_deref(), datamodel) {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => {
            warn!("send eventexpr failed: {}", e);
            sink.raise_error_execution();
            return ActionOutcome::Failed;
        }
    };

    let delay_ms = match (&send.delay, &send.delay_expr) {
        (Some(literal), _) => parse_duration_to_milliseconds(literal),
        (None, Some(expr)) => match datamodel.evaluate(expr) {
            Ok(value) => parse_duration_to_milliseconds(&value),
            Err(e) => {
                warn!("send delayexpr failed: {}", e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        },
        (None, None) => 0,
    };
    if delay_ms < 0 {
        warn!("send delay '{:?}' is not a valid CSS2 duration", send.delay);
        sink.raise_error_execution();
        return ActionOutcome::Failed;
    }
    if delay_ms > 0 && target == crate::registry::TARGET_INTERNAL {
        warn!("send: delay is not allowed for target '#_internal'");
        sink.raise_error_execution();
        return ActionOutcome::Failed;
    }

    let mut params = ParamValues::new();
    for name in &send.name_list {
        match datamodel.get_by_location(name) {
            Ok(value) => {
                params.insert(name.clone(), value);
            }
            Err(e) => {
                warn!("send namelist '{}' failed: {}", name, e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        }
    }
    for p in &send.params {
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
                warn!("send param '{}' failed: {}", p.name, e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        }
    }

    let content = match &send.content_expr {
        Some(expr) => match datamodel.evaluate(expr) {
            Ok(value) => Some(Data::String(value)),
            Err(e) => {
                warn!("send content failed: {}", e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        },
        None => None,
    };

    sink.send(SendRequest {
        send_id,
        target,
        event_name,
        type_uri,
        delay_ms,
        params,
        content,
    });
    ActionOutcome::Completed
}

fn execute_cancel(
    send_id: Option<&str>,
    send_id_expr: Option<&str>,
    datamodel: &mut dyn Datamodel,
    sink: &mut dyn ActionSink,
) -> ActionOutcome {
    let resolved = match (send_id, send_id_expr) {
        (Some(id), _) => Some(id.to_string()),
        (None, Some(expr)) => match datamodel.evaluate(expr) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("cancel sendidexpr failed: {}", e);
                sink.raise_error_execution();
                return ActionOutcome::Failed;
            }
        },
        (None, None) => None,
    };
    if let Some(id) = resolved {
        sink.cancel(&id);
    }
    ActionOutcome::Completed
}

/// CSS2 duration syntax used by `<send delay="...">`/`delayexpr`: a decimal
/// number followed by `ms`, `s`, `m`, `h`, or `d` (case-insensitive).
/// Returns `-1` on a malformed string, matching §7's "invalid delay is an
/// execution error" contract.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    lazy_static! {
        static ref DURATION_RE: Regex =
            Regex::new(r"^(\d*(\.\d+)?)(ms|s|m|h|d)$").unwrap();
    }
    if d.is_empty() {
        return 0;
    }
    let lower = d.to_ascii_lowercase();
    match DURATION_RE.captures(&lower) {
        None => -1,
        Some(cap) => {
            let value = cap.get(1).map_or("", |m| m.as_str());
            let unit = cap.get(3).map_or("", |m| m.as_str());
            if value.is_empty() {
                return 0;
            }
            let v: f64 = match value.parse() {
                Ok(v) => v,
                Err(_) => return -1,
            };
            let millis = match unit {
                "d" => v * 24.0 * 60.0 * 60.0 * 1000.0,
                "h" => v * 60.0 * 60.0 * 1000.0,
                "m" => v * 60_000.0,
                "s" => v * 1000.0,
                "ms" => v,
                _ => return -1,
            };
            millis.round() as i64
        }
    }
}

/// Evaluates any expression to its own literal text, treating `""` and
/// `"undefined"` specially so tests can exercise `execute_send`'s target
/// resolution without a real scripting engine.
#[cfg(test)]
#[derive(Default)]
struct EchoDatamodel;

#[cfg(test)]
impl Datamodel for EchoDatamodel {
    fn engine_name(&self) -> &str {
        "echo"
    }
    fn setup_system_variables(&mut self, _: &str, _: &str, _: &[crate::data_model::IoProcessorInfo], _: &Document) {}
    fn set_current_event(&mut self, _event: &Event) {}
    fn initialize_data(&mut self, _document: &Document, _state: crate::model::StateId) -> Vec<String> {
        Vec::new()
    }
    fn set_variable(&mut self, _name: &str, _value: Data) {}
    fn get_variable(&self, _name: &str) -> Option<Data> {
        None
    }
    fn get_by_location(&mut self, location: &str) -> crate::data_model::EvalResult<Data> {
        Ok(Data::String(location.to_string()))
    }
    fn assign(&mut self, _location: &str, _expr: &str) -> crate::data_model::EvalResult<()> {
        Ok(())
    }
    fn evaluate(&mut self, expr: &str) -> crate::data_model::EvalResult<String> {
        Ok(expr.to_string())
    }
    fn evaluate_condition(&mut self, _expr: &str) -> crate::data_model::EvalResult<bool> {
        Ok(true)
    }
    fn execute_script(&mut self, _script: &str) -> crate::data_model::EvalResult<()> {
        Ok(())
    }
    fn is_in_state(&self, _configuration: &[crate::model::StateId], _state_name: &str) -> bool {
        false
    }
    fn foreach_snapshot(&mut self, _array_expr: &str) -> crate::data_model::EvalResult<Vec<Data>> {
        Ok(Vec::new())
    }
    fn foreach_bind(&mut self, _item: &str, _index: Option<&str>, _value: &Data, _idx: usize) -> crate::data_model::EvalResult<()> {
        Ok(())
    }
}

/// Records every `ActionSink` call so a test can assert on outcome shape
/// without a live `Session`.
#[cfg(test)]
#[derive(Default)]
struct RecordingSink {
    sent: Vec<SendRequest>,
    errors_execution: u32,
    errors_communication: Vec<(Option<SendId>, Option<InvokeId>)>,
}

#[cfg(test)]
impl ActionSink for RecordingSink {
    fn raise_internal(&mut self, _event: Event) {}
    fn log(&mut self, _label: Option<&str>, _message: &str) {}
    fn send(&mut self, req: SendRequest) {
        self.sent.push(req);
    }
    fn cancel(&mut self, _send_id: &str) {}
    fn raise_error_execution(&mut self) {
        self.errors_execution += 1;
    }
    fn raise_error_communication(&mut self, send_id: Option<SendId>, invoke_id: Option<InvokeId>) {
        self.errors_communication.push((send_id, invoke_id));
    }
    fn generate_send_id(&mut self) -> String {
        "generated.1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_with(f: impl FnOnce(&mut SendAction)) -> SendAction {
        let mut send = SendAction::default();
        f(&mut send);
        send
    }

    #[test]
    fn unsupported_type_is_execution_error_and_send_never_dispatches() {
        let mut dm = EchoDatamodel;
        let mut sink = RecordingSink::default();
        let send = send_with(|s| {
            s.event = Some("go".to_string());
            s.type_name = Some("urn:not-a-real-processor".to_string());
        });
        let outcome = execute_send(&send, &mut dm, &mut sink);
        assert_eq!(outcome, ActionOutcome::Failed);
        assert_eq!(sink.errors_execution, 1);
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn bang_prefixed_target_is_execution_error() {
        let mut dm = EchoDatamodel;
        let mut sink = RecordingSink::default();
        let send = send_with(|s| {
            s.event = Some("go".to_string());
            s.target = Some("!notanIRI".to_string());
        });
        let outcome = execute_send(&send, &mut dm, &mut sink);
        assert_eq!(outcome, ActionOutcome::Failed);
        assert_eq!(sink.errors_execution, 1);
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn empty_targetexpr_is_communication_error_not_execution_error() {
        let mut dm = EchoDatamodel;
        let mut sink = RecordingSink::default();
        let send = send_with(|s| {
            s.event = Some("go".to_string());
            s.target_expr = Some("".to_string());
        });
        let outcome = execute_send(&send, &mut dm, &mut sink);
        assert_eq!(outcome, ActionOutcome::Failed);
        assert_eq!(sink.errors_execution, 0);
        assert_eq!(sink.errors_communication.len(), 1);
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn absent_target_attribute_routes_locally_instead_of_erroring() {
        let mut dm = EchoDatamodel;
        let mut sink = RecordingSink::default();
        let send = send_with(|s| {
            s.event = Some("go".to_string());
        });
        let outcome = execute_send(&send, &mut dm, &mut sink);
        assert_eq!(outcome, ActionOutcome::Completed);
        assert_eq!(sink.errors_execution, 0);
        assert!(sink.errors_communication.is_empty());
        assert_eq!(sink.sent.len(), 1);
        assert_eq!(sink.sent[0].target, "");
    }

    #[cfg(feature = "basic-http")]
    #[test]
    fn basic_http_type_without_target_is_communication_error() {
        let mut dm = EchoDatamodel;
        let mut sink = RecordingSink::default();
        let send = send_with(|s| {
            s.event = Some("go".to_string());
            s.type_name = Some(crate::data_model::BASIC_HTTP_EVENT_PROCESSOR.to_string());
        });
        let outcome = execute_send(&send, &mut dm, &mut sink);
        assert_eq!(outcome, ActionOutcome::Failed);
        assert_eq!(sink.errors_execution, 0);
        assert_eq!(sink.errors_communication.len(), 1);
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5d"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1m"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds("250ms"), 250);
        assert_eq!(parse_duration_to_milliseconds(""), 0);
        assert_eq!(parse_duration_to_milliseconds("x1s"), -1);
        assert_eq!(parse_duration_to_milliseconds("1sx"), -1);
    }
}
