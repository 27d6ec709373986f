mod harness;

use harness::{bridge, counter, echo, take_exception};
use tether::{Bridge, BridgeError, Engine, GuestModule, HostValue, Linker};

/// Closures whose destructor index points past the end of the table.
const BAD_DESTRUCTOR: &str = r#"
(module
  (import "__bridge" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "__bridge" "object_drop_ref" (func $object_drop_ref (param i32)))
  (memory (export "memory") 1)
  (table (export "__indirect_function_table") 1 funcref)
  (func (export "__bridge_malloc") (param i32 i32) (result i32) (i32.const 1024))
  (func (export "__bridge_exn_store") (param i32))
  (func $leak (export "leak")
    (call $object_drop_ref
      (call $closure_new (i32.const 0) (i32.const 7) (i32.const 1) (i32.const 0))))
  (func (export "leak_then_trap")
    (call $leak)
    (unreachable)))
"#;

fn make_closure(bridge: &mut tether::Bridge, data: i32, meta: i32) -> Result<u32, anyhow::Error> {
    Ok(bridge.call::<(i32, i32), i32>("make_closure", (data, meta))? as u32)
}

#[test]
fn destructor_runs_once_after_repeated_invocation() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let handle = make_closure(&mut bridge, 42, 0)?;

    for i in 0..5 {
        let out = bridge.invoke(handle, HostValue::from(f64::from(i)))?;
        assert_eq!(out.as_f64(), Some(f64::from(i)));
    }
    assert_eq!(counter(&mut bridge, "invokes")?, 5);
    assert_eq!(counter(&mut bridge, "last_invoke_data")?, 42);
    assert_eq!(counter(&mut bridge, "dtors")?, 0);

    assert_eq!(bridge.call::<i32, i32>("drop_closure", handle as i32)?, 1);
    assert_eq!(counter(&mut bridge, "dtors")?, 1);
    assert_eq!(counter(&mut bridge, "last_dtor_data")?, 42);

    // The handle is gone; dropping again does nothing.
    assert_eq!(bridge.call::<i32, i32>("drop_closure", handle as i32)?, 0);
    assert_eq!(counter(&mut bridge, "dtors")?, 1);
    Ok(())
}

#[test]
fn drop_inside_invocation_defers_the_destructor() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let handle = make_closure(&mut bridge, 77, 1)?;

    bridge.invoke(handle, HostValue::Undefined)?;
    assert_eq!(counter(&mut bridge, "invokes")?, 1);
    assert_eq!(counter(&mut bridge, "dtors")?, 1);
    // The destructor still received the environment cleared during the call.
    assert_eq!(counter(&mut bridge, "last_dtor_data")?, 77);
    assert!(!bridge.heap().is_live(handle));
    Ok(())
}

#[test]
fn guest_can_call_host_function_values() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let closure = make_closure(&mut bridge, 1, 0)?;
    let arg = echo(&mut bridge, "payload")?;

    let result = bridge.call::<(i32, i32), i32>("call_function", (closure as i32, arg as i32))? as u32;
    assert_ne!(result, arg);
    assert_eq!(bridge.heap().get(result).as_str(), Some("payload"));
    assert_eq!(counter(&mut bridge, "invokes")?, 1);
    Ok(())
}

#[test]
fn calling_a_non_function_raises_type_error() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let not_callable = echo(&mut bridge, "text")?;
    let result = bridge.call::<(i32, i32), i32>("call_function", (not_callable as i32, 0))?;
    assert_eq!(result, 0);
    match take_exception(&mut bridge)? {
        HostValue::Error(err) => {
            assert_eq!(err.name, "TypeError");
            assert_eq!(err.message, "string is not a function");
        }
        other => panic!("expected an error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unreachable_closures_are_finalized() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let handle = make_closure(&mut bridge, 5, 0)?;
    bridge.call::<i32, ()>("release", handle as i32)?;
    assert_eq!(counter(&mut bridge, "dtors")?, 1);
    assert_eq!(counter(&mut bridge, "last_dtor_data")?, 5);
    Ok(())
}

#[test]
fn failing_invocation_keeps_the_closure_alive() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let handle = make_closure(&mut bridge, 3, 2)?;

    let err = bridge.invoke(handle, HostValue::Undefined).unwrap_err();
    assert!(matches!(
        err.root_cause().downcast_ref::<BridgeError>(),
        Some(BridgeError::GuestThrow(msg)) if msg == "callback failed"
    ));
    assert_eq!(counter(&mut bridge, "dtors")?, 0);

    assert_eq!(bridge.call::<i32, i32>("drop_closure", handle as i32)?, 1);
    assert_eq!(counter(&mut bridge, "dtors")?, 1);
    assert_eq!(counter(&mut bridge, "last_dtor_data")?, 3);
    Ok(())
}

#[test]
fn invoking_a_non_function_handle_fails_on_the_host() -> Result<(), anyhow::Error> {
    let mut bridge = bridge()?;
    let err = bridge.invoke(tether::NULL, HostValue::Undefined).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: null is not a function");
    Ok(())
}

#[test]
fn export_trap_is_reported_over_a_failing_destructor() -> Result<(), anyhow::Error> {
    let engine = Engine::default();
    let module = GuestModule::new(&engine, BAD_DESTRUCTOR)?;
    let mut bridge = Bridge::new(&engine, Linker::new(&engine));
    bridge.init_sync(&module)?;

    let err = bridge.call::<(), ()>("leak_then_trap", ()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<wasmtime::Trap>(),
        Some(wasmtime::Trap::UnreachableCodeReached)
    ));

    // Without a trap the destructor failure itself surfaces.
    let err = bridge.call::<(), ()>("leak", ()).unwrap_err();
    assert!(matches!(
        err.root_cause().downcast_ref::<BridgeError>(),
        Some(BridgeError::BadTableEntry(7))
    ));
    Ok(())
}
