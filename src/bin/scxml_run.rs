//! Thin demonstration binary: loads an SCXML document from disk, runs it to
//! completion against stdin-driven external events, and prints the final
//! configuration. Carries no interpretation logic of its own — it is nothing
//! more than `reader::parse_str` + `Session::new` + `interpreter::run` wired
//! to a process's stdio, the way the teacher's `bin/fsm.rs` wired the same
//! algorithm to a CLI.

use scxml_core::{get_arguments, ArgOption};

#[cfg(feature = "xml")]
fn run(path: &str, trace: &str) {
    use std::io::BufRead;
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    use scxml_core::create_datamodel;
    use scxml_core::interpreter;
    use scxml_core::invoke::ThreadedInvokeHost;
    use scxml_core::registry::Registry;
    use scxml_core::scheduler::Scheduler;
    use scxml_core::session::{register_session, Session, SessionConfig};
    use scxml_core::tracer::{LogTracer, TraceMode};

    let xml = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("failed to read '{}': {}", path, e);
        std::process::exit(1);
    });
    let document = scxml_core::reader::parse_str(&xml).unwrap_or_else(|e| {
        eprintln!("failed to parse '{}': {}", path, e);
        std::process::exit(1);
    });

    let mode: TraceMode = trace.parse().unwrap_or(TraceMode::NONE);
    let tracer = Box::new(LogTracer::new(mode));

    let registry = Registry::new();
    let scheduler = Arc::new(Scheduler::new());
    let session_id = registry.allocate_session_id();
    let (sender, receiver) = channel();

    let config = SessionConfig::default();
    let datamodel = create_datamodel(&document.datamodel_name);
    let document = Arc::new(document);
    let invoke_host = ThreadedInvokeHost::new(registry.clone(), scheduler.clone());

    let mut session = Session::new(
        session_id,
        "scxml_run".to_string(),
        document,
        datamodel,
        receiver,
        tracer,
        scheduler,
        registry.clone(),
        "scxml_run".to_string(),
    )
    .with_config(config)
    .with_invoke_host(invoke_host);

    register_session(&registry, session_id, sender, None);

    let stdin = std::io::stdin();
    let event_sender = registry.sender_for(session_id).expect("session just registered");
    std::thread::spawn(move || {
        for line in stdin.lock().lines().map_while(Result::ok) {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let _ = event_sender.send(scxml_core::event::Event::external(line));
        }
    });

    interpreter::run(&mut session);
    println!(
        "final configuration: {:?}",
        session
            .configuration
            .iter()
            .map(|id| session.document.state(*id).name.clone())
            .collect::<Vec<_>>()
    );
}

#[cfg(not(feature = "xml"))]
fn run(_path: &str, _trace: &str) {
    eprintln!("scxml_run was built without the 'xml' feature; no document loader is available");
    std::process::exit(1);
}

fn main() {
    #[cfg(feature = "EnvLog")]
    env_logger::init();

    let trace_opt = ArgOption::new("trace").with_value();
    let opts = [&trace_opt];
    let (named, positional) = get_arguments(&opts);

    let Some(path) = positional.first() else {
        eprintln!("usage: scxml_run <document.scxml> [-trace <methods|states|events|all>]");
        std::process::exit(2);
    };

    let trace = named.get("trace").map(String::as_str).unwrap_or("");
    run(path, trace);
}
