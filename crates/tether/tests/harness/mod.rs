#![allow(dead_code)]

use tether::host;
use tether::{Bridge, BridgeConfig, Capability, Engine, GuestModule, HostError, HostValue, Linker, Param, Ret};

/// A guest that exports a bump allocator, an exception slot, a two-entry
/// function table (closure invoke and destructor) and small exports for
/// every bridge path the tests exercise.
///
/// Closure `meta` selects the invoke behaviour: 0 echoes the argument, 1
/// drops the closure from inside the call, 2 throws.
pub const GUEST: &str = r#"
(module
  (import "__bridge" "string_new" (func $string_new (param i32 i32) (result i32)))
  (import "__bridge" "string_get" (func $string_get (param i32 i32)))
  (import "__bridge" "number_new" (func $number_new (param f64) (result i32)))
  (import "__bridge" "object_drop_ref" (func $object_drop_ref (param i32)))
  (import "__bridge" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "__bridge" "cb_drop" (func $cb_drop (param i32) (result i32)))
  (import "__bridge" "function_call" (func $function_call (param i32 i32) (result i32)))
  (import "__bridge" "throw" (func $throw (param i32 i32)))
  (import "host" "console_log" (func $console_log (param i32 i32)))
  (import "host" "document_create_element" (func $create_element (param i32 i32) (result i32)))
  (import "host" "element_tag_name" (func $element_tag_name (param i32 i32)))
  (import "host" "set_timeout" (func $set_timeout (param i32 i32) (result i32)))
  (import "host" "promise_resolve" (func $promise_resolve (param i32) (result i32)))
  (import "host" "promise_then" (func $promise_then (param i32 i32) (result i32)))
  (import "host" "clear_timeout" (func $clear_timeout (param i32)))
  (import "host" "queue_microtask" (func $queue_microtask (param i32)))
  (import "host" "performance_now" (func $performance_now (result f64)))
  (import "host" "clipboard_write_text" (func $clipboard_write_text (param i32 i32) (result i32)))
  (import "host" "clipboard_read_text" (func $clipboard_read_text (result i32)))
  (import "host" "gpu_request_adapter" (func $gpu_request_adapter (result i32)))
  (import "host" "gpu_adapter_name" (func $gpu_adapter_name (param i32 i32)))
  (import "host" "gpu_set_power_preference" (func $gpu_set_power_preference (param i32)))
  (import "host" "gpu_preferred_canvas_format" (func $gpu_preferred_canvas_format (result i32)))
  (import "host" "gpu_set_bind_group" (func $gpu_set_bind_group (param i32 i32 i32)))
  (import "host" "document_body" (func $document_body (result i32)))
  (import "host" "document_get_element_by_id" (func $get_element_by_id (param i32 i32) (result i32)))
  (import "host" "element_set_id" (func $element_set_id (param i32 i32 i32)))
  (import "host" "element_set_text_content" (func $element_set_text_content (param i32 i32 i32)))
  (import "host" "element_text_content" (func $element_text_content (param i32 i32)))
  (import "host" "element_append_child" (func $element_append_child (param i32 i32) (result i32)))
  (import "host" "element_child_count" (func $element_child_count (param i32) (result i32)))
  (import "host" "host_fail" (func $host_fail (param i32 i32)))
  (import "host" "host_crash" (func $host_crash (param i32 i32)))

  (memory (export "memory") 1)
  (table (export "__indirect_function_table") 2 funcref)
  (elem (i32.const 0) $invoke $dtor)
  (data (i32.const 64) "callback failed")

  (global $heap (mut i32) (i32.const 1024))
  (global $exn (mut i32) (i32.const 0))
  (global $closure (mut i32) (i32.const 0))
  (global $starts (mut i32) (i32.const 0))
  (global $mallocs (mut i32) (i32.const 0))
  (global $reallocs (mut i32) (i32.const 0))
  (global $frees (mut i32) (i32.const 0))
  (global $invokes (mut i32) (i32.const 0))
  (global $dtors (mut i32) (i32.const 0))
  (global $last_invoke_data (mut i32) (i32.const -1))
  (global $last_dtor_data (mut i32) (i32.const -1))

  (func $malloc (export "__bridge_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local $limit i32)
    (global.set $mallocs (i32.add (global.get $mallocs) (i32.const 1)))
    (local.set $ptr
      (i32.and
        (i32.add (global.get $heap) (i32.sub (local.get $align) (i32.const 1)))
        (i32.sub (i32.const 0) (local.get $align))))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (local.set $limit (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $limit))
      (then
        (drop (memory.grow
          (i32.add
            (i32.div_u (i32.sub (local.get $end) (local.get $limit)) (i32.const 65536))
            (i32.const 1))))))
    (global.set $heap (local.get $end))
    (local.get $ptr))

  (func (export "__bridge_realloc") (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $fresh i32)
    (global.set $reallocs (i32.add (global.get $reallocs) (i32.const 1)))
    (if (i32.le_u (local.get $new) (local.get $old))
      (then (return (local.get $ptr))))
    (local.set $fresh (call $malloc (local.get $new) (local.get $align)))
    (memory.copy (local.get $fresh) (local.get $ptr) (local.get $old))
    (local.get $fresh))

  (func (export "__bridge_free") (param $ptr i32) (param $size i32) (param $align i32)
    (global.set $frees (i32.add (global.get $frees) (i32.const 1))))

  (func (export "__bridge_exn_store") (param $handle i32)
    (global.set $exn (local.get $handle)))

  (func (export "__bridge_start")
    (global.set $starts (i32.add (global.get $starts) (i32.const 1))))

  (func $invoke (param $data i32) (param $meta i32) (param $arg i32) (result i32)
    (global.set $invokes (i32.add (global.get $invokes) (i32.const 1)))
    (global.set $last_invoke_data (local.get $data))
    (if (i32.eq (local.get $meta) (i32.const 1))
      (then (drop (call $cb_drop (global.get $closure)))))
    (if (i32.eq (local.get $meta) (i32.const 2))
      (then (call $throw (i32.const 64) (i32.const 15))))
    (local.get $arg))

  (func $dtor (param $data i32) (param $meta i32)
    (global.set $dtors (i32.add (global.get $dtors) (i32.const 1)))
    (global.set $last_dtor_data (local.get $data)))

  (func (export "take_exception") (result i32)
    (local $handle i32)
    (local.set $handle (global.get $exn))
    (global.set $exn (i32.const 0))
    (local.get $handle))

  (func (export "starts") (result i32) (global.get $starts))
  (func (export "mallocs") (result i32) (global.get $mallocs))
  (func (export "reallocs") (result i32) (global.get $reallocs))
  (func (export "frees") (result i32) (global.get $frees))
  (func (export "invokes") (result i32) (global.get $invokes))
  (func (export "dtors") (result i32) (global.get $dtors))
  (func (export "last_invoke_data") (result i32) (global.get $last_invoke_data))
  (func (export "last_dtor_data") (result i32) (global.get $last_dtor_data))

  (func $make_closure (export "make_closure") (param $data i32) (param $meta i32) (result i32)
    (global.set $closure
      (call $closure_new (i32.const 0) (i32.const 1) (local.get $data) (local.get $meta)))
    (global.get $closure))

  (func (export "drop_closure") (param $handle i32) (result i32)
    (call $cb_drop (local.get $handle)))

  (func (export "release") (param $handle i32)
    (call $object_drop_ref (local.get $handle)))

  (func (export "call_function") (param $func i32) (param $arg i32) (result i32)
    (call $function_call (local.get $func) (local.get $arg)))

  (func (export "store_byte") (param $addr i32) (param $value i32)
    (i32.store8 (local.get $addr) (local.get $value)))

  (func (export "load_byte") (param $addr i32) (result i32)
    (i32.load8_u (local.get $addr)))

  (func (export "load_word") (param $addr i32) (result i32)
    (i32.load (local.get $addr)))

  (func (export "store_word") (param $addr i32) (param $value i32)
    (i32.store (local.get $addr) (local.get $value)))

  (func (export "grow") (param $pages i32) (result i32)
    (memory.grow (local.get $pages)))

  (func (export "echo") (param $ptr i32) (param $len i32) (result i32)
    (call $string_new (local.get $ptr) (local.get $len)))

  (func (export "string_get_at") (param $retptr i32) (param $handle i32)
    (call $string_get (local.get $retptr) (local.get $handle)))

  (func (export "throw_msg") (param $ptr i32) (param $len i32)
    (call $throw (local.get $ptr) (local.get $len)))

  (func (export "log") (param $ptr i32) (param $len i32)
    (call $console_log (local.get $ptr) (local.get $len)))

  (func (export "create") (param $ptr i32) (param $len i32) (result i32)
    (call $create_element (local.get $ptr) (local.get $len)))

  (func (export "tag_name") (param $retptr i32) (param $handle i32)
    (call $element_tag_name (local.get $retptr) (local.get $handle)))

  (func (export "fail") (param $ptr i32) (param $len i32)
    (call $host_fail (local.get $ptr) (local.get $len)))

  (func (export "crash") (param $ptr i32) (param $len i32)
    (call $host_crash (local.get $ptr) (local.get $len)))

  (func (export "schedule") (param $data i32) (param $delay i32) (result i32)
    (call $set_timeout (call $make_closure (local.get $data) (i32.const 0)) (local.get $delay)))

  (func (export "then_number") (param $value f64) (param $meta i32) (result i32)
    (local $number i32)
    (local $promise i32)
    (local $derived i32)
    (local.set $number (call $number_new (local.get $value)))
    (local.set $promise (call $promise_resolve (local.get $number)))
    (call $object_drop_ref (local.get $number))
    (local.set $derived
      (call $promise_then (local.get $promise) (call $make_closure (i32.const 9) (local.get $meta))))
    (call $object_drop_ref (local.get $promise))
    (local.get $derived))

  (func (export "then_handle") (param $promise i32) (param $data i32) (result i32)
    (call $promise_then (local.get $promise) (call $make_closure (local.get $data) (i32.const 0))))

  (func (export "queue") (param $data i32)
    (call $queue_microtask (call $make_closure (local.get $data) (i32.const 0))))

  (func (export "cancel") (param $id i32)
    (call $clear_timeout (local.get $id)))

  (func (export "now") (result f64)
    (call $performance_now))

  (func (export "clipboard_write") (param $ptr i32) (param $len i32) (result i32)
    (call $clipboard_write_text (local.get $ptr) (local.get $len)))

  (func (export "clipboard_read") (result i32)
    (call $clipboard_read_text))

  (func (export "request_adapter") (result i32)
    (call $gpu_request_adapter))

  (func (export "adapter_name") (param $retptr i32) (param $handle i32)
    (call $gpu_adapter_name (local.get $retptr) (local.get $handle)))

  (func (export "power_preference") (param $index i32)
    (call $gpu_set_power_preference (local.get $index)))

  (func (export "canvas_format") (result i32)
    (call $gpu_preferred_canvas_format))

  (func (export "set_bind_group") (param $index i32) (param $ptr i32) (param $len i32)
    (call $gpu_set_bind_group (local.get $index) (local.get $ptr) (local.get $len)))

  (func (export "body") (result i32)
    (call $document_body))

  (func (export "by_id") (param $ptr i32) (param $len i32) (result i32)
    (call $get_element_by_id (local.get $ptr) (local.get $len)))

  (func (export "set_id") (param $handle i32) (param $ptr i32) (param $len i32)
    (call $element_set_id (local.get $handle) (local.get $ptr) (local.get $len)))

  (func (export "set_text") (param $handle i32) (param $ptr i32) (param $len i32)
    (call $element_set_text_content (local.get $handle) (local.get $ptr) (local.get $len)))

  (func (export "text") (param $retptr i32) (param $handle i32)
    (call $element_text_content (local.get $retptr) (local.get $handle)))

  (func (export "append") (param $parent i32) (param $child i32) (result i32)
    (call $element_append_child (local.get $parent) (local.get $child)))

  (func (export "child_count") (param $handle i32) (result i32)
    (call $element_child_count (local.get $handle)))
)
"#;

/// Sample host plus two capabilities that always fail: `host_fail` reports
/// through the exception slot, `host_crash` traps.
pub fn linker(engine: &Engine) -> Linker {
    let mut linker = Linker::new(engine);
    host::register_defaults(&mut linker);
    linker.define(
        Capability::new("host_fail", &[Param::Str], Ret::Unit, |_, args| {
            Err(HostError::error(args[0].as_str().unwrap_or_default()))
        })
        .fallible(),
    );
    linker.define(Capability::new("host_crash", &[Param::Str], Ret::Unit, |_, args| {
        Err(HostError::error(args[0].as_str().unwrap_or_default()))
    }));
    linker
}

pub fn bridge_with(config: BridgeConfig) -> Result<Bridge, anyhow::Error> {
    let engine = Engine::new(config)?;
    let module = GuestModule::new(&engine, GUEST)?;
    let mut bridge = Bridge::new(&engine, linker(&engine));
    bridge.init_sync(&module)?;
    Ok(bridge)
}

pub fn bridge() -> Result<Bridge, anyhow::Error> {
    bridge_with(BridgeConfig::default())
}

pub fn counter(bridge: &mut Bridge, name: &str) -> Result<i32, anyhow::Error> {
    bridge.call::<(), i32>(name, ())
}

/// Pass `text` into guest memory and have the guest wrap it in a string
/// handle.
pub fn echo(bridge: &mut Bridge, text: &str) -> Result<u32, anyhow::Error> {
    let (ptr, len) = bridge.pass_string(text)?;
    Ok(bridge.call::<(i32, i32), i32>("echo", (ptr as i32, len as i32))? as u32)
}

/// Read a `(ptr, len)` pair a capability stored at `retptr` and decode it.
pub fn read_returned_string(bridge: &mut Bridge, retptr: i32) -> Result<String, anyhow::Error> {
    let ptr = bridge.call::<i32, i32>("load_word", retptr)? as u32;
    let len = bridge.call::<i32, i32>("load_word", retptr + 4)? as u32;
    bridge.read_string(ptr, len)
}

/// Take the value stored in the guest's exception slot, if any.
pub fn take_exception(bridge: &mut Bridge) -> Result<HostValue, anyhow::Error> {
    let handle = bridge.call::<(), i32>("take_exception", ())? as u32;
    Ok(bridge.heap_mut().take(handle)?)
}
