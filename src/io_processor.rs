//! Event I/O Processors (spec §4.7, §6 mandatory processor types): the
//! transports a `<send>`/`<invoke>` target URI is ultimately routed through.
//!
//! The SCXML Event I/O Processor (`scxml` submodule) addresses sessions
//! within this process and is implemented entirely in terms of
//! `registry::Registry` — every session already gets one for free. The
//! BasicHTTP Event I/O Processor (`http` submodule, feature `basic-http`) is
//! the one genuinely external transport this core ships a concrete
//! implementation for, grounded on the teacher's Rocket/ureq-based processor.

pub mod scxml;

#[cfg(feature = "basic-http")]
pub mod http;
