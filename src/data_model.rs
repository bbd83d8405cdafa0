//! Data Model Façade (spec §4.2): session-scoped bindings for variables and
//! system variables, expression/script evaluation, and the `In(state)`
//! predicate. `Datamodel` is the trait every concrete engine (`NullDatamodel`,
//! `EcmaScriptDatamodel`) implements; `Data` is the engine-agnostic value type
//! used at the boundary between executable content and a concrete engine.

use std::collections::HashMap;
use std::fmt;

use crate::event::Event;
use crate::model::{Document, StateId};

/// Names the processor must keep bound for the lifetime of the session and
/// must refuse to let `<assign>`/`<script>` overwrite (spec §8 invariant 3).
pub const SESSION_ID_VAR: &str = "_sessionid";
pub const SESSION_NAME_VAR: &str = "_name";
pub const EVENT_VAR: &str = "_event";
pub const IO_PROCESSORS_VAR: &str = "_ioprocessors";

pub fn is_system_variable(name: &str) -> bool {
    matches!(
        name,
        SESSION_ID_VAR | SESSION_NAME_VAR | EVENT_VAR | IO_PROCESSORS_VAR
    )
}

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";
pub const BASIC_HTTP_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor";

pub const NULL_DATAMODEL: &str = "null";
pub const ECMASCRIPT_DATAMODEL: &str = "ecmascript";

/// Engine-agnostic value carried by the data model, `<param>` values,
/// `donedata`, and `_event.data`.
#[derive(Clone, PartialEq)]
pub enum Data {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Array(Vec<Data>),
    Map(HashMap<String, Data>),
}

impl Data {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Data::Null => serde_json::Value::Null,
            Data::Boolean(b) => serde_json::Value::Bool(*b),
            Data::Integer(i) => serde_json::Value::from(*i),
            Data::Double(d) => serde_json::Value::from(*d),
            Data::String(s) => serde_json::Value::String(s.clone()),
            Data::Array(a) => serde_json::Value::Array(a.iter().map(Data::to_json).collect()),
            Data::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Null => write!(f, "null"),
            Data::Boolean(b) => write!(f, "{}", b),
            Data::Integer(i) => write!(f, "{}", i),
            Data::Double(d) => write!(f, "{}", d),
            Data::String(s) => write!(f, "'{}'", s),
            Data::Array(a) => {
                write!(f, "[")?;
                for (i, e) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Data::Map(m) => write!(f, "{:?}", m),
        }
    }
}

/// Plain key/value store backing the `NullDatamodel` and used as a scratch
/// area by engines that need a side-table (e.g. the `In()` state-name index).
#[derive(Debug, Default)]
pub struct DataStore {
    values: HashMap<String, Data>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, data: Data) {
        self.values.insert(key.to_string(), data);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Binding mode for `<datamodel>`/`<data>` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    Early,
    Late,
}

impl std::str::FromStr for BindingType {
    type Err = ();

    fn from_str(s: &str) -> Result<BindingType, ()> {
        match s.to_ascii_lowercase().as_str() {
            "early" => Ok(BindingType::Early),
            "late" => Ok(BindingType::Late),
            _ => Err(()),
        }
    }
}

/// Descriptor for one registered I/O processor, exposed via `_ioprocessors`.
#[derive(Debug, Clone)]
pub struct IoProcessorInfo {
    pub type_uri: String,
    pub location: String,
}

/// Outcome of evaluating an expression/script/condition: never an exception
/// that crosses into the interpreter — callers turn `Err` into the
/// `error.execution` event per spec §7.
pub type EvalResult<T> = Result<T, String>;

/// The Data Model Façade contract (spec §4.2).
pub trait Datamodel: Send {
    fn engine_name(&self) -> &str;

    /// One-time setup performed when a session starts: binds `_sessionid`,
    /// `_name`, `_ioprocessors`, and the `In()` predicate/state name index.
    fn setup_system_variables(
        &mut self,
        session_id: &str,
        session_name: &str,
        io_processors: &[IoProcessorInfo],
        document: &Document,
    );

    /// Binds `_event` for the duration of evaluating transitions/actions
    /// triggered by this event.
    fn set_current_event(&mut self, event: &Event);

    /// Initializes the `<data>` elements owned by `state` (the document's
    /// pseudo-root for global data). Called at load time for `early` binding
    /// and on first entry of `state` for `late` binding. Returns the `id` of
    /// every `<data>` element whose initializer expression failed to
    /// evaluate; the caller raises one `error.execution` per entry (spec §7
    /// — a bad initializer must not crash the session).
    fn initialize_data(&mut self, document: &Document, state: StateId) -> Vec<String>;

    fn set_variable(&mut self, name: &str, value: Data);
    fn get_variable(&self, name: &str) -> Option<Data>;

    /// Reads a location expression (the left side of `<assign>`, a `param`
    /// `location`, an `idlocation`). `Err` means "error.execution" must be
    /// raised by the caller.
    fn get_by_location(&mut self, location: &str) -> EvalResult<Data>;

    /// Validates and performs `<assign location=.. expr=..>`. Rejects empty
    /// locations and system-variable names per spec §8 invariant 3.
    fn assign(&mut self, location: &str, expr: &str) -> EvalResult<()>;

    /// Evaluates a value expression, returning its string form (as used by
    /// `<log>`, `<send>`'s computed attributes, and `<param expr=..>`).
    fn evaluate(&mut self, expr: &str) -> EvalResult<String>;

    /// Evaluates a boolean `cond`/`<if>` condition.
    fn evaluate_condition(&mut self, expr: &str) -> EvalResult<bool>;

    /// Executes a `<script>` body or top-level `<scxml>` script.
    fn execute_script(&mut self, script: &str) -> EvalResult<()>;

    /// The `In(stateId)` predicate, implemented in terms of the current
    /// configuration every engine is handed a read view of.
    fn is_in_state(&self, configuration: &[StateId], state_name: &str) -> bool;

    /// `<foreach>`: `array` must evaluate to an iterable, `item` must be a
    /// legal variable name. The returned snapshot is taken BEFORE the first
    /// iteration so the caller can run exactly `snapshot.len()` iterations
    /// regardless of body mutations (spec §4.3, §8 invariant 7).
    fn foreach_snapshot(&mut self, array_expr: &str) -> EvalResult<Vec<Data>>;

    /// Writes `item` (and `index`, if given) before one loop body iteration.
    fn foreach_bind(&mut self, item: &str, index: Option<&str>, value: &Data, idx: usize) -> EvalResult<()>;

    /// Refreshes whatever view of the active configuration `is_in_state`/the
    /// `In()` predicate relies on. Called by the interpreter after every
    /// `enter_states`/`exit_states`. Engines that take the configuration as
    /// an explicit parameter everywhere (rather than caching it) can leave
    /// this a no-op.
    fn sync_configuration(&mut self, _configuration: &[StateId]) {}
}

/// *W3C says* (B.1, the Null Data Model): "There is no underlying data
/// model. The boolean expression language consists of the In predicate
/// only." Used when `<scxml datamodel="null">` or no `datamodel` attribute
/// names a registered engine.
#[derive(Default)]
pub struct NullDatamodel {
    store: DataStore,
    state_names: HashMap<String, StateId>,
    configuration: Vec<StateId>,
}

impl NullDatamodel {
    pub fn new() -> NullDatamodel {
        NullDatamodel::default()
    }
}

impl Datamodel for NullDatamodel {
    fn engine_name(&self) -> &str {
        NULL_DATAMODEL
    }

    fn setup_system_variables(
        &mut self,
        _session_id: &str,
        _session_name: &str,
        _io_processors: &[IoProcessorInfo],
        document: &Document,
    ) {
        for state in document.states() {
            self.state_names.insert(state.name.clone(), state.id);
        }
    }

    fn set_current_event(&mut self, _event: &Event) {}

    fn initialize_data(&mut self, _document: &Document, _state: StateId) -> Vec<String> {
        Vec::new()
    }

    fn set_variable(&mut self, _name: &str, _value: Data) {}

    fn get_variable(&self, _name: &str) -> Option<Data> {
        None
    }

    fn get_by_location(&mut self, _location: &str) -> EvalResult<Data> {
        Err("the null data model has no location expressions".to_string())
    }

    fn assign(&mut self, _location: &str, _expr: &str) -> EvalResult<()> {
        Err("the null data model does not support <assign>".to_string())
    }

    fn evaluate(&mut self, _expr: &str) -> EvalResult<String> {
        Err("the null data model has no value expressions".to_string())
    }

    /// Only `In(id)` is supported, matching literal or quoted state names.
    fn evaluate_condition(&mut self, expr: &str) -> EvalResult<bool> {
        lazy_static::lazy_static! {
            static ref IN_RE: regex::Regex = regex::Regex::new(r"^\s*In\((.*)\)\s*$").unwrap();
        }
        match IN_RE.captures(expr) {
            None => Ok(false),
            Some(caps) => {
                let mut value = caps.get(1).map_or("", |m| m.as_str()).trim();
                if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
                    value = &value[1..value.len() - 1];
                }
                Ok(self
                    .state_names
                    .get(value)
                    .is_some_and(|sid| self.configuration.contains(sid)))
            }
        }
    }

    fn execute_script(&mut self, _script: &str) -> EvalResult<()> {
        Err("the null data model has no scripting language".to_string())
    }

    fn is_in_state(&self, configuration: &[StateId], state_name: &str) -> bool {
        self.state_names
            .get(state_name)
            .is_some_and(|sid| configuration.contains(sid))
    }

    fn foreach_snapshot(&mut self, _array_expr: &str) -> EvalResult<Vec<Data>> {
        Err("<foreach> is unsupported in the null data model".to_string())
    }

    fn foreach_bind(&mut self, _item: &str, _index: Option<&str>, _value: &Data, _idx: usize) -> EvalResult<()> {
        Err("<foreach> is unsupported in the null data model".to_string())
    }

    fn sync_configuration(&mut self, configuration: &[StateId]) {
        self.configuration = configuration.to_vec();
    }
}

impl NullDatamodel {
    pub fn store_mut(&mut self) -> &mut DataStore {
        &mut self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_variable_names_are_reserved() {
        assert!(is_system_variable("_sessionid"));
        assert!(is_system_variable("_event"));
        assert!(!is_system_variable("counter"));
    }
}
