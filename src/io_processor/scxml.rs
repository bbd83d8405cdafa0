//! *W3C says* (C.1 the SCXML Event I/O Processor): "the 'location' of the
//! SCXML Event I/O Processor... must be unique among all its siblings." Every
//! session gets one for free; this processor never leaves the process, so
//! "sending" to it is just `Registry::resolve` handing back a live
//! `Sender<Event>` — there is no wire format to implement.

use crate::scheduler::SessionId;

/// The `location` a session advertises for its own SCXML Event I/O Processor,
/// resolvable by any other session in the same process via
/// `registry::Registry::resolve`.
pub fn location_for(session_id: SessionId) -> String {
    format!("#_scxml_{}", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_matches_the_registry_target_prefix() {
        assert_eq!(location_for(7), "#_scxml_7");
    }
}
