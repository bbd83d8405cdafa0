//! Shared harness for the seed-scenario integration tests: starts a session
//! from an inline SCXML string, feeds it a fixed sequence of external events,
//! drives it to completion, and hands back enough state for a test to assert
//! on.
//!
//! Every fixture here reaches a top-level `<final>` on its own — that's what
//! stops `interpreter::run`'s blocking main loop without needing a second
//! thread or a timing-sensitive channel teardown. A fixture that doesn't
//! naturally terminate isn't a scenario this harness can drive.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use scxml_core::data_model::Data;
use scxml_core::event::Event;
use scxml_core::interpreter;
use scxml_core::invoke::ThreadedInvokeHost;
use scxml_core::model::StateId;
use scxml_core::reader;
use scxml_core::registry::Registry;
use scxml_core::scheduler::Scheduler;
use scxml_core::session::{register_session, Session};
use scxml_core::tracer::{TraceMode, TraceRecord, Tracer};

/// Records every `StateEntered` notification so the harness can tell which
/// top-level `<final>` a run landed on, since `exit_interpreter` clears
/// `Session::configuration` before `interpreter::run` returns.
struct RecordingTracer {
    entered: Arc<Mutex<Vec<StateId>>>,
}

impl Tracer for RecordingTracer {
    fn mode(&self) -> TraceMode {
        TraceMode::ALL
    }

    fn trace(&mut self, record: TraceRecord) {
        if let TraceRecord::StateEntered(id) = record {
            self.entered.lock().unwrap().push(id);
        }
    }
}

pub struct RunOutcome {
    pub reached_final: Vec<String>,
    pub datamodel: Box<dyn scxml_core::data_model::Datamodel>,
}

impl RunOutcome {
    pub fn var(&self, name: &str) -> Option<Data> {
        self.datamodel.get_variable(name)
    }

    pub fn reached(&self, name: &str) -> bool {
        self.reached_final.iter().any(|s| s == name)
    }
}

/// Parses `xml`, pre-queues `events` on the session's own external channel,
/// then runs the session to completion and reports every top-level `<final>`
/// state entered along the way (normally exactly one).
pub fn run_to_completion(xml: &str, events: Vec<Event>) -> RunOutcome {
    let document = reader::parse_str(xml).expect("fixture should parse");
    let datamodel = scxml_core::create_datamodel(&document.datamodel_name);
    let document = Arc::new(document);

    let registry = Registry::new();
    let scheduler = Arc::new(Scheduler::new());
    let session_id = registry.allocate_session_id();
    let (sender, receiver) = mpsc::channel();
    register_session(&registry, session_id, sender.clone(), None);

    let invoke_host = ThreadedInvokeHost::new(registry.clone(), scheduler.clone());

    let entered = Arc::new(Mutex::new(Vec::new()));
    let tracer = RecordingTracer {
        entered: entered.clone(),
    };

    let mut session = Session::new(
        session_id,
        "seed_scenario".to_string(),
        document.clone(),
        datamodel,
        receiver,
        Box::new(tracer),
        scheduler,
        registry,
        "seed_scenario".to_string(),
    )
    .with_invoke_host(invoke_host);

    for event in events {
        sender.send(event).expect("session receiver still alive");
    }

    interpreter::run(&mut session);

    let reached_final = entered
        .lock()
        .unwrap()
        .iter()
        .filter(|&&id| {
            let state = document.state(id);
            state.is_final && state.parent == document.root
        })
        .map(|&id| document.state(id).name.clone())
        .collect();

    RunOutcome {
        reached_final,
        datamodel: session.datamodel,
    }
}
