//! ECMAScript Data Model (spec §4.2, §6 "ECMAScript data model"), backed by
//! `boa_engine`. Included when the `ecmascript` feature is enabled.
//! See [W3C:The ECMAScript Data Model](https://www.w3.org/TR/scxml/#ecma-profile).
//! See [GitHub:Boa Engine](https://github.com/boa-dev/boa).

use std::cell::RefCell;
use std::collections::HashMap;
use std::str::FromStr;

use boa_engine::context::ContextBuilder;
use boa_engine::object::builtins::{JsArray, JsMap};
use boa_engine::object::ObjectInitializer;
use boa_engine::property::{Attribute, PropertyDescriptor, PropertyKey};
use boa_engine::value::Type;
use boa_engine::{js_string, native_function::NativeFunction, Context, JsBigInt, JsValue, Source};
use boa_engine::{JsArgs, JsData, JsResult};
use boa_gc::{empty_trace, Finalize, Trace};
use log::{debug, error, warn};

use crate::data_model::{
    is_system_variable, Data, Datamodel, EvalResult, IoProcessorInfo, ECMASCRIPT_DATAMODEL,
};
use crate::event::Event;
use crate::model::{Document, StateId};

/// Carries the state-name index and live configuration into the engine's
/// native functions (`In()`), updated on every `sync_configuration` call.
#[derive(JsData, Finalize)]
struct ConfigWrapper {
    state_names: HashMap<String, StateId>,
    configuration: Vec<StateId>,
}

/// Safety: nothing in this struct is itself garbage-collected by Boa.
unsafe impl Trace for ConfigWrapper {
    empty_trace!();
}

/// `Context` is wrapped in a `RefCell` so that `get_variable`/`is_in_state`
/// (trait methods that only borrow `&self`, since other `Datamodel` engines
/// have no need to mutate on a read) can still drive Boa's evaluator, which
/// requires `&mut Context` even for property reads (getters may run script).
pub struct EcmaScriptDatamodel {
    context: RefCell<Context>,
}

fn js_to_string(value: &JsValue, ctx: &mut Context) -> String {
    match value.to_string(ctx) {
        Ok(s) => s.to_std_string_escaped(),
        Err(_) => value.display().to_string(),
    }
}

fn option_to_js_value(value: &Option<String>) -> JsValue {
    match value {
        Some(s) => JsValue::from(js_string!(s.clone())),
        None => JsValue::Undefined,
    }
}

fn data_to_js(data: &Data, ctx: &mut Context) -> JsValue {
    match data {
        Data::Null => JsValue::Null,
        Data::Boolean(b) => JsValue::Boolean(*b),
        Data::Integer(i) => JsValue::BigInt(JsBigInt::from(*i)),
        Data::Double(d) => JsValue::Rational(*d),
        Data::String(s) => JsValue::String(js_string!(s.clone())),
        Data::Array(items) => {
            let array = JsArray::new(ctx);
            for item in items {
                let js = data_to_js(item, ctx);
                let _ = array.push(js, ctx);
            }
            JsValue::from(array)
        }
        Data::Map(map) => {
            let js_map = JsMap::new(ctx);
            for (key, value) in map {
                let js = data_to_js(value, ctx);
                let _ = js_map.set(js_string!(key.clone()), js, ctx);
            }
            JsValue::from(js_map)
        }
    }
}

fn js_to_data(value: &JsValue, ctx: &mut Context) -> Data {
    match value.get_type() {
        Type::Undefined | Type::Null => Data::Null,
        Type::Boolean => Data::Boolean(value.as_boolean().unwrap_or_default()),
        Type::Number => Data::Double(value.as_number().unwrap_or_default()),
        Type::BigInt => match value.to_big_int64(ctx) {
            Ok(v) => Data::Integer(v),
            Err(_) => Data::Null,
        },
        Type::Symbol | Type::String => Data::String(js_to_string(value, ctx)),
        Type::Object => match value.to_object(ctx) {
            Err(_) => Data::Null,
            Ok(obj) => {
                if obj.is_array() {
                    let array = JsArray::from_object(obj.clone()).unwrap();
                    let len = array.length(ctx).unwrap_or(0) as usize;
                    let mut items = Vec::with_capacity(len);
                    for i in 0..len as u64 {
                        if let Ok(v) = array.get(i, ctx) {
                            items.push(js_to_data(&v, ctx));
                        }
                    }
                    Data::Array(items)
                } else {
                    let keys = obj.own_property_keys(ctx).unwrap_or_default();
                    let mut map = HashMap::with_capacity(keys.len());
                    for key in &keys {
                        let name = match key {
                            PropertyKey::String(s) => s.to_std_string_escaped(),
                            PropertyKey::Symbol(s) => s.fn_name().to_std_string_escaped(),
                            PropertyKey::Index(idx) => idx.get().to_string(),
                        };
                        if let Ok(v) = obj.get(key.clone(), ctx) {
                            map.insert(name, js_to_data(&v, ctx));
                        }
                    }
                    Data::Map(map)
                }
            }
        },
    }
}

fn in_configuration(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let state_name = js_to_string(args.get_or_undefined(0), ctx);
    let in_set = ctx
        .get_data::<ConfigWrapper>()
        .map(|w| {
            w.state_names
                .get(&state_name)
                .is_some_and(|id| w.configuration.contains(id))
        })
        .unwrap_or(false);
    Ok(JsValue::Boolean(in_set))
}

/// *W3C says* (4.6 `<foreach>`): "the SCXML Processor MUST [...] treat
/// [`item`] as a syntax error if it is not a legal identifier in the
/// expression language." A reserved ECMAScript word parses as a valid
/// property name via direct assignment but is never a legal binding target,
/// so it is rejected here rather than left to silently shadow a keyword.
fn is_legal_ecmascript_identifier(name: &str) -> bool {
    const RESERVED: &[&str] = &[
        "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete",
        "do", "else", "export", "extends", "finally", "for", "function", "if", "import", "in",
        "instanceof", "new", "return", "super", "switch", "this", "throw", "try", "typeof", "var",
        "void", "while", "with", "yield", "let", "static", "null", "true", "false", "enum",
        "implements", "interface", "package", "private", "protected", "public",
    ];
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
    let rest_ok = chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$');
    first_ok && rest_ok && !RESERVED.contains(&name)
}

fn log_js(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let mut msg = String::new();
    for arg in args {
        msg.push_str(&js_to_string(arg, ctx));
    }
    debug!("{}", msg);
    Ok(JsValue::Undefined)
}

impl EcmaScriptDatamodel {
    pub fn new() -> EcmaScriptDatamodel {
        let mut context = ContextBuilder::new().build().expect("boa context builds");
        let _ = context.register_global_callable(
            js_string!("__In"),
            1,
            NativeFunction::from_copy_closure(in_configuration),
        );
        let _ = context.eval(Source::from_bytes(
            "function In(state) { return __In(state); }",
        ));
        let _ = context.register_global_callable(
            js_string!("log"),
            1,
            NativeFunction::from_copy_closure(log_js),
        );
        let _ = context.insert_data(ConfigWrapper {
            state_names: HashMap::new(),
            configuration: Vec::new(),
        });
        EcmaScriptDatamodel {
            context: RefCell::new(context),
        }
    }

    fn define_read_only(&self, name: &str, value: JsValue) {
        let mut ctx = self.context.borrow_mut();
        let r = ctx.global_object().define_property_or_throw(
            js_string!(name),
            PropertyDescriptor::builder()
                .configurable(true)
                .enumerable(false)
                .writable(false)
                .value(value),
            &mut ctx,
        );
        if let Err(e) = r {
            error!("failed to define read-only system variable '{}': {}", name, e);
        }
    }

    fn set_global(&self, name: &str, value: JsValue) {
        let mut ctx = self.context.borrow_mut();
        let _ = ctx.global_object().set(js_string!(name), value, false, &mut ctx);
    }

    fn eval_string(&self, expr: &str) -> EvalResult<String> {
        let mut ctx = self.context.borrow_mut();
        match ctx.eval(Source::from_bytes(expr)) {
            Ok(v) if v.is_undefined() => Ok(String::new()),
            Ok(v) => v
                .to_string(&mut ctx)
                .map(|s| s.to_std_string_escaped())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl Default for EcmaScriptDatamodel {
    fn default() -> EcmaScriptDatamodel {
        EcmaScriptDatamodel::new()
    }
}

impl Datamodel for EcmaScriptDatamodel {
    fn engine_name(&self) -> &str {
        ECMASCRIPT_DATAMODEL
    }

    fn setup_system_variables(
        &mut self,
        session_id: &str,
        session_name: &str,
        io_processors: &[IoProcessorInfo],
        document: &Document,
    ) {
        self.define_read_only(
            crate::data_model::SESSION_ID_VAR,
            JsValue::from(js_string!(session_id)),
        );
        self.define_read_only(
            crate::data_model::SESSION_NAME_VAR,
            JsValue::from(js_string!(session_name)),
        );

        let processors_js = {
            let mut ctx = self.context.borrow_mut();
            let processors_js = JsMap::new(&mut ctx);
            for info in io_processors {
                let entry = JsMap::new(&mut ctx);
                let _ = entry.set(js_string!("location"), js_string!(info.location.clone()), &mut ctx);
                let _ = processors_js.set(js_string!(info.type_uri.clone()), entry, &mut ctx);
            }
            processors_js
        };
        self.define_read_only(crate::data_model::IO_PROCESSORS_VAR, JsValue::from(processors_js));

        if let Some(wrapper) = self.context.borrow_mut().get_data_mut::<ConfigWrapper>() {
            wrapper.state_names = document.states().map(|s| (s.name.clone(), s.id)).collect();
        }
    }

    fn set_current_event(&mut self, event: &Event) {
        let mut ctx = self.context.borrow_mut();
        let data_value = match &event.data {
            Some(d) => data_to_js(d, &mut ctx),
            None => JsValue::Undefined,
        };

        let mut builder = ObjectInitializer::new(&mut ctx);
        builder
            .property(js_string!("name"), js_string!(event.name.clone()), Attribute::READONLY)
            .property(
                js_string!("type"),
                js_string!(event.event_type.as_str()),
                Attribute::READONLY,
            )
            .property(
                js_string!("sendid"),
                option_to_js_value(&event.send_id),
                Attribute::READONLY,
            )
            .property(
                js_string!("origin"),
                option_to_js_value(&event.origin),
                Attribute::READONLY,
            )
            .property(
                js_string!("origintype"),
                option_to_js_value(&event.origin_type),
                Attribute::READONLY,
            )
            .property(
                js_string!("invokeid"),
                option_to_js_value(&event.invoke_id),
                Attribute::READONLY,
            )
            .property(js_string!("data"), data_value, Attribute::READONLY);
        let event_object = builder.build();

        let _ = ctx
            .global_object()
            .delete_property_or_throw(js_string!(crate::data_model::EVENT_VAR), &mut ctx);
        let r = ctx.global_object().define_property_or_throw(
            js_string!(crate::data_model::EVENT_VAR),
            PropertyDescriptor::builder()
                .configurable(true)
                .enumerable(false)
                .writable(false)
                .value(event_object),
            &mut ctx,
        );
        if let Err(e) = r {
            error!("failed to bind _event: {}", e);
        }
    }

    /// *W3C says* (6.4.4): "If the value specified for a <data> element (by
    /// 'src', children, or the environment) is not a legal data value, the
    /// SCXML Processor MUST place the error 'error.execution' in the internal
    /// event queue and MUST create an empty data element in the data model
    /// with the specified id." `src` fetching is a host-level I/O concern
    /// this core does not perform, so a `<data src=..>` is always reported as
    /// a failure alongside any expression that fails to evaluate.
    fn initialize_data(&mut self, document: &Document, state: StateId) -> Vec<String> {
        let mut failures = Vec::new();
        for spec in &document.state(state).datamodel {
            let value = if let Some(literal) = &spec.literal {
                Some(data_to_js(literal, &mut self.context.borrow_mut()))
            } else if let Some(expr) = &spec.expr {
                match self.context.borrow_mut().eval(Source::from_bytes(expr)) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!("<data id='{}'> initializer failed: {}", spec.id, e);
                        failures.push(spec.id.clone());
                        None
                    }
                }
            } else if spec.src.is_some() {
                warn!("<data id='{}' src=..> is unsupported by this data model", spec.id);
                failures.push(spec.id.clone());
                None
            } else {
                Some(JsValue::Undefined)
            };
            self.set_global(&spec.id, value.unwrap_or(JsValue::Undefined));
        }
        failures
    }

    fn set_variable(&mut self, name: &str, value: Data) {
        if is_system_variable(name) {
            warn!("refusing to overwrite system variable '{}'", name);
            return;
        }
        let js = data_to_js(&value, &mut self.context.borrow_mut());
        self.set_global(name, js);
    }

    fn get_variable(&self, name: &str) -> Option<Data> {
        let mut ctx = self.context.borrow_mut();
        let value = ctx.global_object().get(js_string!(name), &mut ctx).ok()?;
        if value.is_undefined() {
            None
        } else {
            Some(js_to_data(&value, &mut ctx))
        }
    }

    fn get_by_location(&mut self, location: &str) -> EvalResult<Data> {
        let mut ctx = self.context.borrow_mut();
        match ctx.eval(Source::from_bytes(location)) {
            Ok(v) => Ok(js_to_data(&v, &mut ctx)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn assign(&mut self, location: &str, expr: &str) -> EvalResult<()> {
        if is_system_variable(location) {
            return Err(format!("'{}' is a read-only system variable", location));
        }
        let source = format!("{}={}", location, expr);
        self.context
            .borrow_mut()
            .eval(Source::from_bytes(&source))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn evaluate(&mut self, expr: &str) -> EvalResult<String> {
        self.eval_string(expr)
    }

    /// *W3C says* (B.2.3 Conditional Expressions): "The Processor must
    /// convert ECMAScript expressions used in conditional expressions into
    /// their effective boolean value using the ToBoolean operator."
    fn evaluate_condition(&mut self, expr: &str) -> EvalResult<bool> {
        let wrapped = format!("({})?true:false", expr);
        match self.eval_string(&wrapped) {
            Ok(s) => bool::from_str(&s).map_err(|e| e.to_string()),
            Err(e) => Err(e),
        }
    }

    fn execute_script(&mut self, script: &str) -> EvalResult<()> {
        self.context
            .borrow_mut()
            .eval(Source::from_bytes(script))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_in_state(&self, configuration: &[StateId], state_name: &str) -> bool {
        configuration.iter().any(|id| {
            self.context
                .borrow()
                .get_data::<ConfigWrapper>()
                .is_some_and(|w| w.state_names.get(state_name) == Some(id))
        })
    }

    fn foreach_snapshot(&mut self, array_expr: &str) -> EvalResult<Vec<Data>> {
        let mut ctx = self.context.borrow_mut();
        let value = ctx.eval(Source::from_bytes(array_expr)).map_err(|e| e.to_string())?;
        match value.get_type() {
            Type::Object => {
                let obj = value.to_object(&mut ctx).map_err(|e| e.to_string())?;
                if obj.is_array() {
                    let array = JsArray::from_object(obj).map_err(|e| e.to_string())?;
                    let len = array.length(&mut ctx).map_err(|e| e.to_string())? as usize;
                    let mut items = Vec::with_capacity(len);
                    for i in 0..len as u64 {
                        let item = array.get(i, &mut ctx).map_err(|e| e.to_string())?;
                        items.push(js_to_data(&item, &mut ctx));
                    }
                    Ok(items)
                } else {
                    Ok(vec![js_to_data(&value, &mut ctx)])
                }
            }
            _ => Err("<foreach> array expression did not evaluate to a collection".to_string()),
        }
    }

    fn foreach_bind(&mut self, item: &str, index: Option<&str>, value: &Data, idx: usize) -> EvalResult<()> {
        if is_system_variable(item) {
            return Err(format!("'{}' is a read-only system variable", item));
        }
        if !is_legal_ecmascript_identifier(item) {
            return Err(format!("'{}' is not a legal <foreach> item identifier", item));
        }
        if let Some(index_name) = index {
            if !is_legal_ecmascript_identifier(index_name) {
                return Err(format!("'{}' is not a legal <foreach> index identifier", index_name));
            }
        }
        let js = data_to_js(value, &mut self.context.borrow_mut());
        self.set_global(item, js);
        if let Some(index_name) = index {
            self.set_global(index_name, JsValue::from((idx + 1) as i32));
        }
        Ok(())
    }

    fn sync_configuration(&mut self, configuration: &[StateId]) {
        if let Some(wrapper) = self.context.borrow_mut().get_data_mut::<ConfigWrapper>() {
            wrapper.configuration = configuration.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentBuilder;

    fn empty_document() -> Document {
        let mut b = DocumentBuilder::new();
        let root = b.add_state(crate::model::State {
            id: 0,
            doc_id: 1,
            name: "root".to_string(),
            parent: crate::model::NONE,
            children: vec![],
            is_parallel: false,
            is_final: false,
            history_type: crate::model::HistoryType::None,
            initial_transition: crate::model::NONE,
            transitions: vec![],
            onentry: vec![],
            onexit: vec![],
            invoke: vec![],
            datamodel: vec![],
            donedata: None,
        });
        b.build(root, crate::model::NONE).unwrap()
    }

    #[test]
    fn condition_evaluates_truthy_expression() {
        let mut dm = EcmaScriptDatamodel::new();
        assert_eq!(dm.evaluate_condition("1 + 1 == 2"), Ok(true));
        assert_eq!(dm.evaluate_condition("1 == 2"), Ok(false));
    }

    #[test]
    fn assign_then_evaluate_round_trips() {
        let mut dm = EcmaScriptDatamodel::new();
        dm.assign("counter", "41").unwrap();
        dm.assign("counter", "counter + 1").unwrap();
        assert_eq!(dm.evaluate("counter").unwrap(), "42");
    }

    #[test]
    fn system_variable_assignment_is_rejected() {
        let mut dm = EcmaScriptDatamodel::new();
        assert!(dm.assign(crate::data_model::SESSION_ID_VAR, "'x'").is_err());
    }

    #[test]
    fn foreach_snapshot_collects_before_any_mutation() {
        let mut dm = EcmaScriptDatamodel::new();
        dm.execute_script("var arr = [1,2,3];").unwrap();
        let snapshot = dm.foreach_snapshot("arr").unwrap();
        assert_eq!(snapshot.len(), 3);
        dm.execute_script("arr.push(4); arr.length = 0;").unwrap();
        // the snapshot already taken is unaffected by later mutation of `arr`
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn in_predicate_reflects_synced_configuration() {
        let doc = empty_document();
        let mut dm = EcmaScriptDatamodel::new();
        dm.setup_system_variables("s1", "test", &[], &doc);
        dm.sync_configuration(&[1]);
        assert_eq!(dm.evaluate_condition("In('root')"), Ok(true));
    }
}
