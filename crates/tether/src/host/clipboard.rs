use tracing::debug;

use super::expect_string;
use crate::error::HostError;
use crate::linker::{Capability, Linker, Param, Ret};
use crate::tasks::Deferred;
use crate::value::HostValue;

/// In-memory clipboard. Set `denied` to make every access reject.
#[derive(Debug, Default)]
pub struct Clipboard {
    pub text: String,
    pub denied: bool,
}

fn not_allowed() -> HostError {
    HostError::new("NotAllowedError", "Clipboard access denied")
}

pub(super) fn register(linker: &mut Linker) {
    linker.define(Capability::new("clipboard_write_text", &[Param::Str], Ret::Handle, |cx, args| {
        let clipboard = cx.extensions.get_or_insert_with(Clipboard::default);
        if clipboard.denied {
            return Ok(HostValue::Object(Deferred::rejected(not_allowed())));
        }
        clipboard.text = expect_string(&args[0]).to_string();
        debug!(len = clipboard.text.len(), "clipboard written");
        Ok(HostValue::Object(Deferred::resolved(HostValue::Undefined)))
    }));
    linker.define(Capability::new("clipboard_read_text", &[], Ret::Handle, |cx, _| {
        let clipboard = cx.extensions.get_or_insert_with(Clipboard::default);
        let deferred = if clipboard.denied {
            Deferred::rejected(not_allowed())
        } else {
            Deferred::resolved(HostValue::from(clipboard.text.as_str()))
        };
        Ok(HostValue::Object(deferred))
    }));
}
