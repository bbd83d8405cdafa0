//! Default `InvokeHost` (spec §4.6 SUPPLEMENT): starts an `<invoke>` child as
//! an independent `Session` on its own thread, grounded on the teacher's
//! `FsmExecutor`/`ExecuteState` thread-per-session model (`fsm_executor.rs`)
//! but speaking `Document`/`Session`/`interpreter::run` instead of `Fsm`.
//!
//! Only inline `<content>` children are supported — fetching an external
//! `src=` document is the kind of file-loading concern the core treats as an
//! external collaborator (spec §1 Non-goals), so this host reports it as a
//! failed invocation rather than reaching for the filesystem itself. A host
//! embedding this crate that wants `src=` support supplies its own
//! `InvokeHost` that resolves it before handing XML text to [`reader`].

use std::sync::{Arc, Weak};
use std::thread;

use log::warn;

use crate::event::ParamValues;
use crate::interpreter::{self, InvokeHost};
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SessionId};
use crate::session::{register_session, Session, SessionConfig};
use crate::tracer::NullTracer;

/// Starts every `<invoke>` child as a real `Session` running on its own OS
/// thread, sharing the parent's [`Registry`] and [`Scheduler`] so
/// `#_parent`/`#_<invokeid>` sends and delayed sends work the same as for any
/// other session the process hosts.
pub struct ThreadedInvokeHost {
    registry: Registry,
    scheduler: Arc<Scheduler>,
    self_ref: Weak<ThreadedInvokeHost>,
}

impl ThreadedInvokeHost {
    pub fn new(registry: Registry, scheduler: Arc<Scheduler>) -> Arc<ThreadedInvokeHost> {
        Arc::new_cyclic(|self_ref| ThreadedInvokeHost {
            registry,
            scheduler,
            self_ref: self_ref.clone(),
        })
    }
}

impl InvokeHost for ThreadedInvokeHost {
    fn start(
        &self,
        parent: SessionId,
        invoke_id: &str,
        type_name: &str,
        src: Option<&str>,
        content: Option<&str>,
        params: &ParamValues,
    ) -> Result<SessionId, String> {
        if !type_name.is_empty()
            && type_name != crate::data_model::SCXML_EVENT_PROCESSOR
            && type_name != "scxml"
        {
            return Err(format!("unsupported invoke type '{}'", type_name));
        }

        let xml = match (content, src) {
            (Some(text), _) => text.to_string(),
            (None, Some(src)) => {
                return Err(format!(
                    "ThreadedInvokeHost does not fetch external <invoke src=\"{}\">; supply inline <content> or a host-provided InvokeHost",
                    src
                ));
            }
            (None, None) => return Err("<invoke> has neither content nor src".to_string()),
        };

        let document = crate::reader::parse_str(&xml)?;
        let datamodel = crate::create_datamodel(&document.datamodel_name);
        let document = Arc::new(document);

        let child_id = self.registry.allocate_session_id();
        let (sender, receiver) = std::sync::mpsc::channel();
        register_session(&self.registry, child_id, sender, Some(parent));
        // Recorded before the child thread is spawned: a child that reaches
        // <final> immediately must be able to find this invocation through
        // the parent's registry the moment it looks up `invoke_id_for` to
        // send `done.invoke.<id>` home (spec §4.6).
        self.registry.record_invocation(invoke_id.to_string(), child_id);

        let host: Arc<dyn InvokeHost> = match self.self_ref.upgrade() {
            Some(strong) => strong,
            None => return Err("invoke host dropped before child could start".to_string()),
        };

        let mut config = SessionConfig::default();
        config.initial_data = params.clone();

        let mut session = Session::new(
            child_id,
            invoke_id.to_string(),
            document,
            datamodel,
            receiver,
            Box::new(NullTracer),
            self.scheduler.clone(),
            self.registry.clone(),
            "invoke".to_string(),
        )
        .with_config(config)
        .with_invoke_host(host);

        let spawned = thread::Builder::new()
            .name(format!("scxml-invoke-{}", invoke_id))
            .spawn(move || interpreter::run(&mut session));
        if let Err(e) = spawned {
            self.registry.forget_invocation(invoke_id);
            self.registry.deregister(child_id);
            return Err(format!("failed to spawn invoke thread: {}", e));
        }

        Ok(child_id)
    }

    fn cancel(&self, child: SessionId) {
        // Dropping the child's sender here would be redundant: the caller
        // (`interpreter::cancel_invoke`) already deregisters `child` from the
        // shared `Registry`, which drops this host's last reference to its
        // sender and unblocks the child's `external_receiver.recv()` with an
        // error, ending its main event loop (spec §4.6: "the SCXML Processor
        // MUST terminate the processing of the invoked process").
        if self.registry.sender_for(child).is_none() {
            warn!("cancel: invoked session {} was already gone", child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_invoke_type() {
        let host = ThreadedInvokeHost::new(Registry::new(), Arc::new(Scheduler::new()));
        let params = ParamValues::new();
        let result = host.start(1, "inv1", "http://example.com/not-scxml", None, Some("<scxml/>"), &params);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_external_src() {
        let host = ThreadedInvokeHost::new(Registry::new(), Arc::new(Scheduler::new()));
        let params = ParamValues::new();
        let result = host.start(1, "inv1", "", Some("child.scxml"), None, &params);
        assert!(result.is_err());
    }

    #[test]
    fn starts_inline_child_session() {
        let registry = Registry::new();
        let scheduler = Arc::new(Scheduler::new());
        let (sender, _receiver) = std::sync::mpsc::channel();
        register_session(&registry, 1, sender, None);

        let host = ThreadedInvokeHost::new(registry.clone(), scheduler);
        let params = ParamValues::new();
        let xml = r#"<scxml initial="a"><state id="a"/></scxml>"#;
        let child = host
            .start(1, "inv1", "", None, Some(xml), &params)
            .expect("inline child should start");
        assert_ne!(child, 1);
    }
}
