use std::rc::Rc;

use super::not_a;
use crate::closure::ClosureRecord;
use crate::error::HostError;
use crate::linker::{Capability, Linker, Param, Ret};
use crate::tasks::{Deferred, Microtask};
use crate::value::HostValue;

fn callback(value: &HostValue) -> Result<Rc<ClosureRecord>, HostError> {
    value.as_function().cloned().ok_or_else(|| not_a(value, "a function"))
}

fn promise(value: &HostValue) -> Result<Rc<Deferred>, HostError> {
    value.downcast::<Deferred>().ok_or_else(|| not_a(value, "a promise"))
}

pub(super) fn register(linker: &mut Linker) {
    linker.define(
        Capability::new("set_timeout", &[Param::Handle, Param::I32], Ret::I32, |cx, args| {
            let callback = callback(&args[0])?;
            let delay = args[1].as_f64().unwrap_or_default().max(0.0) as u64;
            Ok(HostValue::Number(f64::from(cx.events.set_timeout(callback, delay))))
        })
        .fallible(),
    );
    linker.define(Capability::new("clear_timeout", &[Param::I32], Ret::Unit, |cx, args| {
        let id = args[0].as_f64().unwrap_or_default() as u32;
        cx.events.clear_timeout(id);
        Ok(HostValue::Undefined)
    }));
    linker.define(
        Capability::new("queue_microtask", &[Param::Handle], Ret::Unit, |cx, args| {
            cx.events.queue_microtask(Microtask {
                callback: callback(&args[0])?,
                arg: HostValue::Undefined,
                settle: None,
            });
            Ok(HostValue::Undefined)
        })
        .fallible(),
    );
    linker.define(Capability::new("promise_resolve", &[Param::Handle], Ret::Handle, |cx, args| {
        let value = args.into_iter().next().unwrap_or(HostValue::Undefined);
        if value.downcast_ref::<Deferred>().is_some() {
            return Ok(value);
        }
        let deferred = Deferred::new();
        deferred.resolve(value, cx.events);
        Ok(HostValue::Object(deferred))
    }));
    linker.define(
        Capability::new(
            "promise_then",
            &[Param::Handle, Param::Handle],
            Ret::Handle,
            |cx, args| {
                let promise = promise(&args[0])?;
                let callback = callback(&args[1])?;
                Ok(HostValue::Object(promise.then(callback, cx.events)))
            },
        )
        .fallible(),
    );
}
