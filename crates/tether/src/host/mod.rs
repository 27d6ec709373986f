//! Sample host environment.
//!
//! Small capability groups keyed by receiver type. Their semantics are kept
//! minimal; they exist so guests can exercise every marshal kind, the
//! exception slot and the event loop against something that behaves like a
//! browser host.

mod clipboard;
mod console;
mod document;
mod gpu;
mod timers;

pub use clipboard::Clipboard;
pub use console::{ConsoleLog, Level};
pub use document::{Document, Element};
pub use gpu::{Adapter, Gpu, POWER_PREFERENCES, TEXTURE_FORMATS};

use crate::error::HostError;
use crate::linker::{Capability, Linker, Ret};
use crate::value::HostValue;

/// Register every sample capability on `linker`.
pub fn register_defaults(linker: &mut Linker) -> &mut Linker {
    console::register(linker);
    document::register(linker);
    timers::register(linker);
    clipboard::register(linker);
    gpu::register(linker);
    linker.define(Capability::new("performance_now", &[], Ret::F64, |cx, _| {
        Ok(HostValue::Number(cx.events.now_ms()))
    }))
}

fn expect_string(value: &HostValue) -> &str {
    value.as_str().unwrap_or_default()
}

fn not_a(value: &HostValue, what: &str) -> HostError {
    HostError::type_error(format!("{} is not {what}", value.type_name()))
}
