//! Event Model (spec §2.3, §3 "Event", §6 event name reservations).

use std::collections::HashMap;
use std::fmt;

use crate::data_model::Data;

/// *W3C says*: events have `type` field set to "platform" (raised by the
/// platform itself), "internal" (raised by `<raise>` or `<send target="#_internal">`)
/// or "external" (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Platform,
    Internal,
    External,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Platform => "platform",
            EventType::Internal => "internal",
            EventType::External => "external",
        }
    }
}

/// Session-scoped identifier for a dispatched `<send>`, used by `<cancel>`.
pub type SendId = String;
pub type InvokeId = String;

/// An SCXML event, carrying the metadata §3/§6 require on every field.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub event_type: EventType,
    pub send_id: Option<SendId>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<InvokeId>,
    pub data: Option<Data>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Names reserved for platform use by §6: `done.*` and `error.*`.
pub fn is_platform_reserved_name(name: &str) -> bool {
    name.starts_with("done.") || name.starts_with("error.")
}

impl Event {
    pub fn external(name: impl Into<String>) -> Event {
        Event {
            name: name.into(),
            event_type: EventType::External,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: None,
        }
    }

    pub fn internal(name: impl Into<String>) -> Event {
        Event {
            name: name.into(),
            event_type: EventType::Internal,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: None,
        }
    }

    pub fn platform(name: impl Into<String>) -> Event {
        Event {
            name: name.into(),
            event_type: EventType::Platform,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Option<Data>) -> Event {
        self.data = data;
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: Option<InvokeId>) -> Event {
        self.invoke_id = invoke_id;
        self
    }

    pub fn with_send_id(mut self, send_id: Option<SendId>) -> Event {
        self.send_id = send_id;
        self
    }

    /// *W3C says*: "Indicates that an error internal to the execution of the
    /// document has occurred, such as one arising from expression evaluation."
    pub fn error_execution() -> Event {
        Event::platform("error.execution")
    }

    pub fn error_execution_for(send_id: Option<SendId>, invoke_id: Option<InvokeId>) -> Event {
        Event::platform("error.execution")
            .with_send_id(send_id)
            .with_invoke_id(invoke_id)
    }

    /// *W3C says*: "Indicates that an error has occurred while trying to
    /// communicate with an external entity."
    pub fn error_communication(send_id: Option<SendId>, invoke_id: Option<InvokeId>) -> Event {
        Event::platform("error.communication")
            .with_send_id(send_id)
            .with_invoke_id(invoke_id)
    }

    pub fn done_state(state_id: &str, donedata: Option<Data>) -> Event {
        Event::internal(format!("done.state.{}", state_id)).with_data(donedata)
    }

    pub fn done_invoke(invoke_id: &str, donedata: Option<Data>) -> Event {
        Event::external(format!("done.invoke.{}", invoke_id))
            .with_data(donedata)
            .with_invoke_id(Some(invoke_id.to_string()))
    }

    /// §4.4 "event descriptor matching" (W3C 3.12 / 5.9.3).
    ///
    /// A descriptor is a space-separated list of tokens; any token matching
    /// is sufficient. `"*"` matches anything. `"a.b"` matches `a.b` and any
    /// name beginning with `a.b.`; token boundaries are dot-delimited, so
    /// `"foo"` does not match `"foobar"`.
    pub fn descriptor_matches(descriptors: &str, event_name: &str) -> bool {
        descriptors
            .split_whitespace()
            .any(|token| token_matches(token, event_name))
    }
}

fn token_matches(token: &str, event_name: &str) -> bool {
    let token = token.strip_suffix(".*").unwrap_or(token);
    if token == "*" {
        return true;
    }
    if token == event_name {
        return true;
    }
    event_name
        .strip_prefix(token)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// Snapshot of `<param>`/`namelist` values attached to a `<send>`.
pub type ParamValues = HashMap<String, Data>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_matching_boundary_cases() {
        assert!(Event::descriptor_matches("foo", "foo"));
        assert!(Event::descriptor_matches("foo", "foo.bar"));
        assert!(!Event::descriptor_matches("foo", "foobar"));
        assert!(!Event::descriptor_matches("foo", "foox"));
        assert!(Event::descriptor_matches("*", "anything.goes"));
        assert!(Event::descriptor_matches("a.b a.b.*", "a.b.c"));
        assert!(Event::descriptor_matches("a.b", "a.b"));
    }

    #[test]
    fn reserved_names() {
        assert!(is_platform_reserved_name("done.state.s1"));
        assert!(is_platform_reserved_name("error.execution"));
        assert!(!is_platform_reserved_name("myapp.tick"));
    }
}
