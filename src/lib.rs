//! `scxml-core`: a W3C SCXML 1.0 interpreter core.
//!
//! The crate is split the way the spec separates concerns: [`model`] is the
//! frozen document representation a [`reader`] builds, [`interpreter`] is the
//! microstep/macrostep algorithm driving a [`session::Session`], and
//! [`data_model`]/[`ecma_datamodel`] are the pluggable expression-language
//! façade. [`scheduler`] and [`registry`] are the two pieces of shared,
//! cross-session state a process hosting more than one session needs.
//! [`io_processor`] holds the concrete Event I/O Processor implementations
//! this crate ships (the in-process SCXML one always, BasicHTTP behind a
//! feature); anything else is left to the host, per the external-collaborator
//! boundary the spec draws around I/O.

extern crate core;

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use log::error;

pub mod collections;
pub mod data_model;
pub mod event;
pub mod executable_content;
pub mod interpreter;
pub mod io_processor;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod tracer;

#[cfg(feature = "ecmascript")]
pub mod ecma_datamodel;

#[cfg(feature = "xml")]
pub mod invoke;

#[cfg(feature = "xml")]
pub mod reader;

use tracer::TraceMode;

/// Instantiates the concrete data model engine named by a document's
/// `datamodel` attribute (W3C 5.1), falling back to the null data model for
/// anything this crate doesn't ship a concrete engine for. Shared by
/// `bin/scxml_run.rs` and [`invoke::ThreadedInvokeHost`] so a child session
/// started by `<invoke>` picks its engine the same way a top-level one does.
pub fn create_datamodel(name: &str) -> Box<dyn data_model::Datamodel> {
    #[cfg(feature = "ecmascript")]
    if name == data_model::ECMASCRIPT_DATAMODEL {
        return Box::new(ecma_datamodel::EcmaScriptDatamodel::new());
    }
    let _ = name;
    Box::new(data_model::NullDatamodel::new())
}

/// Applies a runtime `Trace*` feature toggle requested on the command line
/// to a live session's tracer mode. Mirrors the teacher's `handle_trace`,
/// rehomed onto the new `Tracer`/`TraceMode` pair (spec §9: explicit
/// Tracer interface rather than a global observer list).
pub fn handle_trace(tracer: &mut dyn tracer::Tracer, opt: &str, enable: bool) -> TraceMode {
    match TraceMode::from_str(opt) {
        Ok(requested) => {
            let current = tracer.mode();
            let merged = TraceMode {
                methods: (current.methods && !enable) || (requested.methods && enable),
                states: (current.states && !enable) || (requested.states && enable),
                events: (current.events && !enable) || (requested.events && enable),
            };
            merged
        }
        Err(e) => {
            error!("unknown trace option '{}': {}", opt, e);
            tracer.mode()
        }
    }
}

/// Descriptor a program argument option (spec §6.3 ambient config: the demo
/// binary's only configuration surface besides `SessionConfig`).
pub struct ArgOption {
    pub name: &'static str,
    pub required: bool,
    pub with_value: bool,
}

impl ArgOption {
    /// Creates a new option with the specified name.
    pub fn new(name: &'static str) -> ArgOption {
        ArgOption {
            name,
            required: false,
            with_value: false,
        }
    }

    /// Defines this option as "required".
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Defines that this option needs a value.
    pub fn with_value(mut self) -> Self {
        self.with_value = true;
        self
    }
}

/// Parse program arguments.
pub fn get_arguments(arguments: &[&ArgOption]) -> (HashMap<&'static str, String>, Vec<String>) {
    let mut final_args = Vec::<String>::new();

    let args: Vec<String> = env::args().collect();
    let mut idx = 1;
    let mut map = HashMap::new();

    // Don't use clap to parse arguments for now to reduce dependencies.
    while idx < args.len() {
        let arg = &args[idx];
        idx += 1;

        if let Some(sarg) = arg.strip_prefix('-') {
            let sarg = sarg.trim_start_matches('-');
            let mut match_found = false;
            for opt in arguments {
                match_found = opt.name == sarg;
                if match_found {
                    if opt.with_value {
                        if idx >= args.len() {
                            panic!("Missing value for argument '{}'", opt.name);
                        }
                        map.insert(opt.name, args[idx].clone());
                        idx += 1;
                    } else {
                        map.insert(opt.name, String::new());
                    }
                    break;
                }
            }
            if !match_found {
                panic!("Unknown option '{}'", arg);
            }
        } else {
            final_args.push(arg.clone());
        }
    }

    for opt in arguments {
        if opt.required && !map.contains_key(opt.name) {
            panic!("Missing required argument '{}'", opt.name);
        }
    }

    (map, final_args)
}
