//! Tracer/Logger interface (§9 design note: "explicit Logger/Tracer
//! interface instead of a global singleton").
//!
//! `Tracer` receives structured notifications of interpreter-internal
//! activity (state entry/exit, transitions taken, events processed) that a
//! host can subscribe to independently of textual logging. It is always
//! compiled in; the `Trace`/`Trace_Method`/`Trace_State`/`Trace_Event`
//! feature flags only control which calls the interpreter actually makes
//! (so a release build without `Debug` pays no per-microstep cost beyond a
//! feature-gated no-op).

use crate::event::Event;
use crate::model::{StateId, TransitionId};

/// Selects which categories of trace calls `Tracer::enable` turns on,
/// mirroring the `Trace_Method`/`Trace_State`/`Trace_Event` feature split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceMode {
    pub methods: bool,
    pub states: bool,
    pub events: bool,
}

impl TraceMode {
    pub const NONE: TraceMode = TraceMode {
        methods: false,
        states: false,
        events: false,
    };
    pub const ALL: TraceMode = TraceMode {
        methods: true,
        states: true,
        events: true,
    };
}

impl std::str::FromStr for TraceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<TraceMode, String> {
        match s.to_ascii_lowercase().as_str() {
            "methods" => Ok(TraceMode {
                methods: true,
                ..TraceMode::NONE
            }),
            "states" => Ok(TraceMode {
                states: true,
                ..TraceMode::NONE
            }),
            "events" => Ok(TraceMode {
                events: true,
                ..TraceMode::NONE
            }),
            "all" | "debug" => Ok(TraceMode::ALL),
            "" | "none" => Ok(TraceMode::NONE),
            other => Err(format!("unknown trace option '{}'", other)),
        }
    }
}

/// A single structured event a host can subscribe to (§9: "single-writer
/// observer channel instead of addObserver/removeObserver lists").
#[derive(Debug, Clone)]
pub enum TraceRecord {
    MethodEnter(&'static str),
    MethodExit(&'static str),
    StateEntered(StateId),
    StateExited(StateId),
    TransitionTaken(TransitionId),
    EventProcessed(Event),
    EventDiscarded(Event),
}

/// Implemented by the interpreter's single notification channel. `Tracer`
/// does not fan out to a list of listeners — a host wanting multiple
/// subscribers composes them behind one `Tracer` implementation.
pub trait Tracer: Send {
    fn mode(&self) -> TraceMode;
    fn trace(&mut self, record: TraceRecord);
}

/// The default `Tracer`: writes through the `log` facade at `trace` level,
/// gated by the compiled-in feature flags, never `println!`.
pub struct LogTracer {
    mode: TraceMode,
}

impl LogTracer {
    pub fn new(mode: TraceMode) -> LogTracer {
        LogTracer { mode }
    }
}

impl Default for LogTracer {
    fn default() -> Self {
        LogTracer::new(TraceMode::NONE)
    }
}

impl Tracer for LogTracer {
    fn mode(&self) -> TraceMode {
        self.mode
    }

    fn trace(&mut self, record: TraceRecord) {
        match record {
            TraceRecord::MethodEnter(name) if self.mode.methods => {
                log::trace!("-> {}", name);
            }
            TraceRecord::MethodExit(name) if self.mode.methods => {
                log::trace!("<- {}", name);
            }
            TraceRecord::StateEntered(id) if self.mode.states => {
                log::trace!("enter state #{}", id);
            }
            TraceRecord::StateExited(id) if self.mode.states => {
                log::trace!("exit state #{}", id);
            }
            TraceRecord::TransitionTaken(id) if self.mode.states => {
                log::trace!("transition #{}", id);
            }
            TraceRecord::EventProcessed(ref event) if self.mode.events => {
                log::trace!("processed event {}", event);
            }
            TraceRecord::EventDiscarded(ref event) if self.mode.events => {
                log::trace!("discarded event {}", event);
            }
            _ => {}
        }
    }
}

/// A `Tracer` that discards everything; used when a session is constructed
/// without the `Debug`/`Trace*` features enabled.
#[derive(Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::NONE
    }

    fn trace(&mut self, _record: TraceRecord) {}
}

/// `TestTracer`-equivalent (teacher's `test_tracer.rs`): records every
/// accepted record in order so assertions can inspect the trace after a
/// test run completes.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTracer {
    pub records: Vec<TraceRecord>,
}

#[cfg(test)]
impl Tracer for RecordingTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::ALL
    }

    fn trace(&mut self, record: TraceRecord) {
        self.records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn trace_mode_from_str() {
        assert_eq!(TraceMode::from_str("all").unwrap(), TraceMode::ALL);
        assert_eq!(TraceMode::from_str("").unwrap(), TraceMode::NONE);
        assert!(TraceMode::from_str("bogus").is_err());
    }

    #[test]
    fn recording_tracer_keeps_order() {
        let mut t = RecordingTracer::default();
        t.trace(TraceRecord::StateEntered(1));
        t.trace(TraceRecord::StateEntered(2));
        assert_eq!(t.records.len(), 2);
    }
}
