//! BasicHTTP Event I/O Processor (spec C.2, the one mandatory *external*
//! transport this core ships a concrete implementation for). Grounded on the
//! teacher's `basic_http_event_io_processor.rs` responsibility split — a
//! client side that posts an event to a remote location, a server side that
//! exposes one route per locally hosted session — but ported onto this
//! crate's `ureq`/`rocket` dependency pair instead of the teacher's
//! hyper/tokio stack, and onto `Registry`/`Event` instead of `Fsm`.
//!
//! *W3C says* (C.2): "the event name is... in the '_scxmleventname' field of
//! the submitted data." Every other submitted field becomes a `_event.data`
//! entry on the receiving side.

use std::collections::HashMap;

use log::warn;
use rocket::data::ToByteUnit;
use rocket::http::Status;
use rocket::{post, routes, Build, Rocket, State};

use crate::data_model::Data;
use crate::event::{Event, ParamValues};
use crate::registry::Registry;
use crate::scheduler::SessionId;

/// Form field carrying the event name, per spec C.2.
pub const EVENT_NAME_PARAM: &str = "_scxmleventname";

/// Builds the `location` a BasicHTTP-addressable session advertises: the
/// path a remote `<send target="http://host:port/scxml/<id>">` must hit.
pub fn location_for(base_url: &str, session_id: SessionId) -> String {
    format!("{}/scxml/{}", base_url.trim_end_matches('/'), session_id)
}

/// Posts `event` to `url` as an `application/x-www-form-urlencoded` body
/// (spec C.2: "the Processor must support... HTTP POST"). `params` becomes
/// additional form fields alongside `_scxmleventname`; blocks the calling
/// thread, matching the synchronous `ureq` client the teacher's stack
/// otherwise leaves unimplemented.
pub fn send_to_url(url: &str, event_name: &str, params: &ParamValues) -> Result<(), String> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    body.append_pair(EVENT_NAME_PARAM, event_name);
    for (key, value) in params {
        let rendered = match value {
            Data::String(s) => s.clone(),
            other => other.to_string(),
        };
        body.append_pair(key, &rendered);
    }
    let encoded = body.finish();

    ureq::post(url)
        .set("Content-Type", "application/x-www-form-urlencoded")
        .send_string(&encoded)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[post("/scxml/<session_id>", data = "<body>")]
async fn receive(
    session_id: u32,
    body: rocket::data::Data<'_>,
    registry: &State<Registry>,
) -> Status {
    let raw = match body.open(256.kilobytes()).into_string().await {
        Ok(capped) => capped.into_inner(),
        Err(e) => {
            warn!("BasicHTTP: failed to read request body: {}", e);
            return Status::BadRequest;
        }
    };

    let mut event_name = None;
    let mut params: HashMap<String, Data> = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        if key == EVENT_NAME_PARAM {
            event_name = Some(value.into_owned());
        } else {
            params.insert(key.into_owned(), Data::String(value.into_owned()));
        }
    }

    // *W3C says* (C.2): "If the request does not contain a field named
    // '_scxmleventname'... the name of the event raised is the method of the
    // HTTP request" — a bare POST with no event name still raises an event,
    // it is just named after the HTTP method rather than BadRequest.
    let name = event_name.unwrap_or_else(|| "HTTP.POST".to_string());

    let event = Event::external(name).with_data(if params.is_empty() {
        None
    } else {
        Some(Data::Map(params))
    });

    match registry.sender_for(session_id as SessionId) {
        Some(sender) => {
            let _ = sender.send(event);
            Status::Ok
        }
        None => Status::NotFound,
    }
}

/// Assembles the Rocket instance a host runs to make every locally hosted
/// session BasicHTTP-addressable. The host is responsible for `.launch()`ing
/// it on a Tokio runtime (this crate depends on `tokio` already for exactly
/// this); `io_processor::http` never spawns a runtime of its own so a host
/// embedding multiple Rocket-backed components keeps a single one.
pub fn build_rocket(registry: Registry) -> Rocket<Build> {
    rocket::build().manage(registry).mount("/", routes![receive])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_for_strips_trailing_slash_on_base() {
        assert_eq!(location_for("http://host:8080/", 3), "http://host:8080/scxml/3");
        assert_eq!(location_for("http://host:8080", 3), "http://host:8080/scxml/3");
    }
}
