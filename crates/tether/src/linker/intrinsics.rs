//! Fixed bridge intrinsics every guest may import.
//!
//! Conversion intrinsics that fail (bad UTF-8, out-of-range pointers, dead
//! handles in strict mode) store the failure in the guest's exception slot
//! and return a zero sentinel. `throw` and failures inside guest callbacks
//! trap.

use wasmtime::{AsContextMut, Caller};

use crate::error::{BridgeError, HostError};
use crate::heap::UNDEFINED;
use crate::store::{BridgeState, GuestCx};
use crate::value::HostValue;

/// Names importable from the intrinsics module.
pub const INTRINSICS: &[&str] = &[
    "string_new",
    "string_get",
    "bytes_new",
    "bytes_get",
    "number_new",
    "number_get",
    "bool_get",
    "is_undefined",
    "is_null",
    "is_object",
    "is_string",
    "is_function",
    "object_clone_ref",
    "object_drop_ref",
    "debug_string",
    "error_new",
    "throw",
    "closure_new",
    "cb_drop",
    "function_call",
];

type VmLinker = wasmtime::Linker<BridgeState>;

fn with_cx<R>(
    caller: &mut Caller<'_, BridgeState>,
    f: impl FnOnce(&mut GuestCx<'_>) -> anyhow::Result<R>,
) -> anyhow::Result<R> {
    let mut cx = GuestCx::new(caller.as_context_mut())?;
    f(&mut cx)
}

/// Unwrap a conversion result, or store the failure and yield `sentinel`.
fn or_raise<T>(cx: &mut GuestCx<'_>, result: Result<T, BridgeError>, sentinel: T) -> anyhow::Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            cx.raise(HostError::from(&err))?;
            Ok(sentinel)
        }
    }
}

fn predicate(linker: &mut VmLinker, module: &str, name: &str, test: fn(&HostValue) -> bool) -> anyhow::Result<()> {
    linker.func_wrap(module, name, move |caller: Caller<'_, BridgeState>, handle: i32| -> anyhow::Result<i32> {
        Ok(test(&caller.data().heap.get(handle as u32)) as i32)
    })?;
    Ok(())
}

pub(super) fn define(linker: &mut VmLinker, module: &str) -> anyhow::Result<()> {
    // Strings and bytes
    linker.func_wrap(module, "string_new", |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
        with_cx(&mut caller, |cx| {
            let text = cx.read_string(ptr as u32, len as u32).map(HostValue::from);
            let value = or_raise(cx, text, HostValue::Undefined)?;
            Ok(cx.state().heap.alloc(value) as i32)
        })
    })?;
    linker.func_wrap(module, "string_get", |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| {
        with_cx(&mut caller, |cx| {
            let (ptr, len) = match cx.state().heap.get(handle as u32) {
                HostValue::String(s) => cx.write_string(&s)?,
                _ => (0, 0),
            };
            cx.write_pair(retptr as u32, ptr, len)?;
            Ok(())
        })
    })?;
    linker.func_wrap(module, "bytes_new", |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
        with_cx(&mut caller, |cx| {
            let bytes = cx
                .read_bytes(ptr as u32, len as u32)
                .map(|b| HostValue::Bytes(b.into()));
            let value = or_raise(cx, bytes, HostValue::Undefined)?;
            Ok(cx.state().heap.alloc(value) as i32)
        })
    })?;
    linker.func_wrap(module, "bytes_get", |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| {
        with_cx(&mut caller, |cx| {
            let (ptr, len) = match cx.state().heap.get(handle as u32) {
                HostValue::Bytes(b) => cx.write_bytes(&b)?,
                _ => (0, 0),
            };
            cx.write_pair(retptr as u32, ptr, len)?;
            Ok(())
        })
    })?;

    // Numbers and booleans
    linker.func_wrap(module, "number_new", |mut caller: Caller<'_, BridgeState>, n: f64| -> anyhow::Result<i32> {
        Ok(caller.data_mut().heap.alloc(HostValue::Number(n)) as i32)
    })?;
    linker.func_wrap(module, "number_get", |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| {
        with_cx(&mut caller, |cx| {
            let value = cx.state().heap.get(handle as u32).as_f64();
            cx.write_i32(retptr as u32, value.is_some() as i32)?;
            cx.write_f64(retptr as u32 + 8, value.unwrap_or(0.0))?;
            Ok(())
        })
    })?;
    linker.func_wrap(module, "bool_get", |caller: Caller<'_, BridgeState>, handle: i32| -> anyhow::Result<i32> {
        Ok(match caller.data().heap.get(handle as u32) {
            HostValue::Bool(true) => 1,
            HostValue::Bool(false) => 0,
            _ => 2,
        })
    })?;

    // Type predicates
    predicate(linker, module, "is_undefined", HostValue::is_undefined)?;
    predicate(linker, module, "is_null", HostValue::is_null)?;
    predicate(linker, module, "is_object", HostValue::is_object)?;
    predicate(linker, module, "is_string", |v| matches!(v, HostValue::String(_)))?;
    predicate(linker, module, "is_function", |v| matches!(v, HostValue::Function(_)))?;

    // Handle lifetime
    linker.func_wrap(module, "object_clone_ref", |mut caller: Caller<'_, BridgeState>, handle: i32| {
        with_cx(&mut caller, |cx| {
            let cloned = cx.state().heap.clone_ref(handle as u32);
            Ok(or_raise(cx, cloned, UNDEFINED)? as i32)
        })
    })?;
    linker.func_wrap(module, "object_drop_ref", |mut caller: Caller<'_, BridgeState>, handle: i32| {
        with_cx(&mut caller, |cx| {
            let released = cx.state().heap.release(handle as u32);
            or_raise(cx, released, ())
        })
    })?;

    // Diagnostics and errors
    linker.func_wrap(module, "debug_string", |mut caller: Caller<'_, BridgeState>, retptr: i32, handle: i32| {
        with_cx(&mut caller, |cx| {
            let text = cx.state().heap.get(handle as u32).debug_string();
            let (ptr, len) = cx.write_string(&text)?;
            cx.write_pair(retptr as u32, ptr, len)?;
            Ok(())
        })
    })?;
    linker.func_wrap(module, "error_new", |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
        with_cx(&mut caller, |cx| {
            let message = cx.read_string(ptr as u32, len as u32);
            let message = or_raise(cx, message, String::new())?;
            Ok(cx.state().heap.alloc(HostValue::error(HostError::error(message))) as i32)
        })
    })?;
    linker.func_wrap(module, "throw", |mut caller: Caller<'_, BridgeState>, ptr: i32, len: i32| {
        with_cx(&mut caller, |cx| -> anyhow::Result<()> {
            let message = cx.read_string(ptr as u32, len as u32)?;
            Err(BridgeError::GuestThrow(message).into())
        })
    })?;

    // Closures
    linker.func_wrap(
        module,
        "closure_new",
        |mut caller: Caller<'_, BridgeState>, invoke: i32, dtor: i32, data: i32, meta: i32| -> anyhow::Result<i32> {
            let state = caller.data_mut();
            let record = state
                .closures
                .create(invoke as u32, dtor as u32, data as u32, meta as u32);
            Ok(state.heap.alloc(HostValue::Function(record)) as i32)
        },
    )?;
    linker.func_wrap(module, "cb_drop", |mut caller: Caller<'_, BridgeState>, handle: i32| {
        with_cx(&mut caller, |cx| {
            let taken = cx.state().heap.take(handle as u32);
            match or_raise(cx, taken, HostValue::Undefined)? {
                HostValue::Function(record) => Ok(record.drop_ref(cx)? as i32),
                HostValue::Undefined => Ok(0),
                other => {
                    let err = HostError::type_error(format!("{} is not a closure", other.type_name()));
                    cx.raise(err)?;
                    Ok(0)
                }
            }
        })
    })?;
    linker.func_wrap(module, "function_call", |mut caller: Caller<'_, BridgeState>, func: i32, arg: i32| {
        with_cx(&mut caller, |cx| {
            let callee = cx.state().heap.get(func as u32);
            let Some(record) = callee.as_function() else {
                let err = HostError::type_error(format!("{} is not a function", callee.type_name()));
                cx.raise(err)?;
                return Ok(UNDEFINED as i32);
            };
            let arg = cx.state().heap.get(arg as u32);
            let result = cx.invoke_closure(record, arg)?;
            Ok(cx.state().heap.alloc(result) as i32)
        })
    })?;
    Ok(())
}
