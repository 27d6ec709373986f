//! Capability thunks: lift core arguments, run the host function, lower the
//! result.

use std::rc::Rc;

use tracing::debug;
use wasmtime::{AsContextMut, Caller, FuncType, Val};

use super::{Capability, Param, Ret};
use crate::error::{BridgeError, HostError};
use crate::parse::Signature;
use crate::store::{BridgeState, GuestCx};
use crate::value::HostValue;

fn vm_type(ty: wasmparser::ValType) -> wasmtime::ValType {
    match ty {
        wasmparser::ValType::F64 => wasmtime::ValType::F64,
        _ => wasmtime::ValType::I32,
    }
}

/// VM function type for a capability signature. Capability signatures only
/// ever contain `i32` and `f64`.
pub(super) fn func_type(engine: &wasmtime::Engine, sig: &Signature) -> FuncType {
    FuncType::new(
        engine,
        sig.params.iter().copied().map(vm_type),
        sig.results.iter().copied().map(vm_type),
    )
}

/// A host result checked against the capability's result kind.
enum Lowered {
    Unit,
    I32(i32),
    F64(f64),
    Handle(HostValue),
    Str(Option<Rc<str>>),
}

impl Lowered {
    fn check(ret: Ret, value: HostValue) -> Result<Self, HostError> {
        let mismatch = |expected: &str, value: &HostValue| {
            HostError::type_error(format!(
                "host returned {} where {expected} was expected",
                value.type_name()
            ))
        };
        Ok(match (ret, value) {
            (Ret::Unit, _) => Lowered::Unit,
            (Ret::I32, HostValue::Number(n)) => Lowered::I32(n as i32),
            (Ret::I32, HostValue::Bool(b)) => Lowered::I32(b as i32),
            (Ret::F64, HostValue::Number(n)) => Lowered::F64(n),
            (Ret::Bool, HostValue::Bool(b)) => Lowered::I32(b as i32),
            (Ret::Handle, value) => Lowered::Handle(value),
            (Ret::OptionalHandle, HostValue::Undefined | HostValue::Null) => {
                Lowered::Handle(HostValue::Undefined)
            }
            (Ret::OptionalHandle, value) => Lowered::Handle(value),
            (Ret::Str, HostValue::String(s)) => Lowered::Str(Some(s)),
            (Ret::Str, HostValue::Undefined | HostValue::Null) => Lowered::Str(None),
            (Ret::Enum(table), HostValue::String(s)) => {
                let index = table.iter().position(|v| *v == &*s).unwrap_or(table.len());
                Lowered::I32(index as i32)
            }
            (Ret::I32, value) => return Err(mismatch("a number", &value)),
            (Ret::F64, value) => return Err(mismatch("a number", &value)),
            (Ret::Bool, value) => return Err(mismatch("a boolean", &value)),
            (Ret::Str | Ret::Enum(_), value) => return Err(mismatch("a string", &value)),
        })
    }

    /// Result written when the call failed into the exception slot.
    fn sentinel(ret: Ret) -> Self {
        match ret {
            Ret::Unit => Lowered::Unit,
            Ret::I32 | Ret::Bool | Ret::Enum(_) => Lowered::I32(0),
            Ret::F64 => Lowered::F64(0.0),
            Ret::Handle | Ret::OptionalHandle => Lowered::Handle(HostValue::Undefined),
            Ret::Str => Lowered::Str(None),
        }
    }
}

/// Entry point of every capability thunk.
pub(super) fn dispatch(
    caller: &mut Caller<'_, BridgeState>,
    index: usize,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let capability: Rc<Capability> = caller
        .data()
        .capabilities
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("capability {index} is not registered"))?;
    let mut cx = GuestCx::new(caller.as_context_mut())?;

    let (retptr, params) = if capability.ret.uses_retptr() {
        (next_u32(&mut params.iter())?, &params[1..])
    } else {
        (0, params)
    };

    let args = match lift_args(&mut cx, &capability.params, params) {
        Ok(args) => args,
        Err(err) => {
            debug!(capability = %capability.name, error = %err, "argument conversion failed");
            cx.raise(HostError::from(&err))?;
            return lower(&mut cx, Lowered::sentinel(capability.ret), retptr, results);
        }
    };

    let outcome = {
        let mut host = cx.state().host_cx();
        (capability.func)(&mut host, args)
    }
    .and_then(|value| Lowered::check(capability.ret, value));

    match outcome {
        Ok(lowered) => lower(&mut cx, lowered, retptr, results),
        Err(err) if capability.fallible => {
            debug!(capability = %capability.name, error = %err, "capability failed");
            cx.raise(err)?;
            lower(&mut cx, Lowered::sentinel(capability.ret), retptr, results)
        }
        Err(err) => Err(BridgeError::Host(err).into()),
    }
}

fn next_i32<'v>(vals: &mut impl Iterator<Item = &'v Val>) -> Result<i32, BridgeError> {
    vals.next()
        .and_then(Val::i32)
        .ok_or_else(|| BridgeError::Host(HostError::type_error("expected an i32 argument")))
}

fn next_u32<'v>(vals: &mut impl Iterator<Item = &'v Val>) -> Result<u32, BridgeError> {
    next_i32(vals).map(|v| v as u32)
}

fn next_f64<'v>(vals: &mut impl Iterator<Item = &'v Val>) -> Result<f64, BridgeError> {
    vals.next()
        .and_then(Val::f64)
        .ok_or_else(|| BridgeError::Host(HostError::type_error("expected an f64 argument")))
}

fn lift_args(
    cx: &mut GuestCx<'_>,
    kinds: &[Param],
    params: &[Val],
) -> Result<Vec<HostValue>, BridgeError> {
    let mut vals = params.iter();
    let mut args = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let value = match kind {
            Param::I32 => HostValue::Number(f64::from(next_i32(&mut vals)?)),
            Param::F64 => HostValue::Number(next_f64(&mut vals)?),
            Param::Bool => HostValue::Bool(next_i32(&mut vals)? != 0),
            Param::Handle => {
                let handle = next_u32(&mut vals)?;
                cx.state().heap.try_get(handle)?
            }
            Param::Str => {
                let ptr = next_u32(&mut vals)?;
                let len = next_u32(&mut vals)?;
                HostValue::from(cx.read_string(ptr, len)?)
            }
            Param::Bytes => {
                let ptr = next_u32(&mut vals)?;
                let len = next_u32(&mut vals)?;
                HostValue::Bytes(cx.read_bytes(ptr, len)?.into())
            }
            Param::Enum(table) => {
                let index = next_u32(&mut vals)?;
                let value = table.get(index as usize).ok_or_else(|| {
                    BridgeError::Host(HostError::type_error(format!(
                        "{index} is not a valid enum index"
                    )))
                })?;
                HostValue::from(*value)
            }
            Param::U32Array => {
                let ptr = next_u32(&mut vals)?;
                let len = next_u32(&mut vals)?;
                HostValue::Words(cx.read_words(ptr, len)?.into())
            }
        };
        args.push(value);
    }
    Ok(args)
}

fn lower(
    cx: &mut GuestCx<'_>,
    lowered: Lowered,
    retptr: u32,
    results: &mut [Val],
) -> anyhow::Result<()> {
    match lowered {
        Lowered::Unit => {}
        Lowered::I32(v) => results[0] = Val::I32(v),
        Lowered::F64(v) => results[0] = Val::F64(v.to_bits()),
        Lowered::Handle(value) => {
            let handle = cx.state().heap.alloc(value);
            results[0] = Val::I32(handle as i32);
        }
        Lowered::Str(Some(s)) => {
            let (ptr, len) = cx.write_string(&s)?;
            cx.write_pair(retptr, ptr, len)?;
        }
        Lowered::Str(None) => cx.write_pair(retptr, 0, 0)?,
    }
    Ok(())
}
