use tracing::{error, info, warn};

use super::expect_string;
use crate::linker::{Capability, Linker, Param, Ret};
use crate::value::HostValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Log,
    Warn,
    Error,
}

/// Messages the guest printed, in order.
#[derive(Debug, Default)]
pub struct ConsoleLog {
    pub entries: Vec<(Level, String)>,
}

impl ConsoleLog {
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, m)| m.as_str())
    }
}

pub(super) fn register(linker: &mut Linker) {
    for (name, level) in [
        ("console_log", Level::Log),
        ("console_warn", Level::Warn),
        ("console_error", Level::Error),
    ] {
        linker.define(Capability::new(name, &[Param::Str], Ret::Unit, move |cx, args| {
            let message = expect_string(&args[0]).to_string();
            match level {
                Level::Log => info!(target: "tether::console", "{message}"),
                Level::Warn => warn!(target: "tether::console", "{message}"),
                Level::Error => error!(target: "tether::console", "{message}"),
            }
            cx.extensions
                .get_or_insert_with(ConsoleLog::default)
                .entries
                .push((level, message));
            Ok(HostValue::Undefined)
        }));
    }
}
