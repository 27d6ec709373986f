//! Per-instance bridge state and the guest access context.
//!
//! Everything the bridge tracks for one guest lives in [`BridgeState`], the
//! data of the VM store. [`GuestCx`] pairs that state with the bound guest
//! exports and is what host thunks, intrinsics and the [`crate::Bridge`]
//! itself use to allocate in, read from and call back into the guest.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};
use wasmtime::{Ref, StoreContextMut};

use crate::closure::{ClosureRecord, ClosureRegistry, GuestCallbacks};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, HostError};
use crate::heap::HandleTable;
use crate::instance::GuestExports;
use crate::linker::Capability;
use crate::memory::{ByteView, MemoryViews};
use crate::string::{self, GuestAllocator, StringCodec};
use crate::tasks::EventLoop;
use crate::value::HostValue;

/// Typed bag of host-side state shared by capabilities.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any>>,
}

impl Extensions {
    pub fn insert<T: 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|b| b.downcast_mut())
    }

    pub fn get_or_insert_with<T: 'static>(&mut self, f: impl FnOnce() -> T) -> &mut T {
        self.map
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(f()))
            .downcast_mut()
            .expect("extension is stored under its own TypeId")
    }
}

/// What a capability's host function can reach.
pub struct HostCx<'a> {
    pub events: &'a mut EventLoop,
    pub extensions: &'a mut Extensions,
}

/// Runtime state for one guest instance.
pub struct BridgeState {
    pub(crate) config: BridgeConfig,
    pub(crate) heap: HandleTable,
    pub(crate) closures: ClosureRegistry,
    pub(crate) views: MemoryViews,
    pub(crate) codec: StringCodec,
    pub(crate) events: EventLoop,
    pub(crate) extensions: Extensions,
    pub(crate) capabilities: Vec<Rc<Capability>>,
    pub(crate) exports: Option<GuestExports>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            heap: HandleTable::new(config.initial_handles, config.strict_handles),
            codec: StringCodec::new(config.decode_ceiling),
            closures: ClosureRegistry::new(),
            views: MemoryViews::new(),
            events: EventLoop::new(),
            extensions: Extensions::default(),
            capabilities: Vec::new(),
            exports: None,
            config,
        }
    }

    pub fn heap(&self) -> &HandleTable {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HandleTable {
        &mut self.heap
    }

    pub fn host_cx(&mut self) -> HostCx<'_> {
        HostCx {
            events: &mut self.events,
            extensions: &mut self.extensions,
        }
    }
}

/// Access to a bound guest from host code.
pub struct GuestCx<'a> {
    cx: StoreContextMut<'a, BridgeState>,
    exports: GuestExports,
}

impl<'a> GuestCx<'a> {
    /// Fails when the guest exports have not been bound yet.
    pub fn new(cx: StoreContextMut<'a, BridgeState>) -> Result<Self, BridgeError> {
        let exports = cx.data().exports.clone().ok_or(BridgeError::NotInitialized)?;
        Ok(Self { cx, exports })
    }

    pub fn state(&mut self) -> &mut BridgeState {
        self.cx.data_mut()
    }

    pub fn state_ref(&self) -> &BridgeState {
        self.cx.data()
    }

    pub fn free(&mut self, ptr: u32, size: u32, align: u32) -> anyhow::Result<()> {
        if let Some(free) = &self.exports.free {
            free.call(&mut self.cx, (ptr as i32, size as i32, align as i32))?;
        }
        Ok(())
    }

    /// Decode a guest UTF-8 range.
    pub fn read_string(&mut self, ptr: u32, len: u32) -> Result<String, BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        let BridgeState { views, codec, .. } = state;
        codec.read_string(views, mem, ptr, len)
    }

    pub fn read_bytes(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        Ok(state.views.bytes(mem).read(ptr, len)?.to_vec())
    }

    /// Copy `len` u32 words starting at byte offset `ptr`.
    pub fn read_words(&mut self, ptr: u32, len: u32) -> Result<Vec<u32>, BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        state.views.words(mem).read_u32_array(ptr, len)
    }

    pub fn write_string(&mut self, value: &str) -> anyhow::Result<(u32, u32)> {
        string::write_string(self, value)
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> anyhow::Result<(u32, u32)> {
        string::write_bytes(self, value)
    }

    /// Store a `(ptr, len)` pair as two words at `retptr`.
    pub fn write_pair(&mut self, retptr: u32, ptr: u32, len: u32) -> Result<(), BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        let mut words = state.views.words(mem);
        words.write_u32(retptr, ptr)?;
        words.write_u32(retptr + 4, len)
    }

    pub fn write_i32(&mut self, offset: u32, value: i32) -> Result<(), BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        state.views.words(mem).write_i32(offset, value)
    }

    pub fn write_f64(&mut self, offset: u32, value: f64) -> Result<(), BridgeError> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        state.views.floats(mem).write_f64(offset, value)
    }

    /// Hand a failure to the guest's exception slot.
    pub fn raise(&mut self, err: HostError) -> anyhow::Result<()> {
        debug!(name = %err.name, message = %err.message, "storing guest exception");
        let handle = self.state().heap.alloc(HostValue::error(err));
        self.exports.exn_store.call(&mut self.cx, handle as i32)?;
        Ok(())
    }

    /// Call a closure with a host argument, taking ownership of the value it
    /// returns.
    pub fn invoke_closure(
        &mut self,
        record: &Rc<ClosureRecord>,
        arg: HostValue,
    ) -> anyhow::Result<HostValue> {
        let arg = self.state().heap.alloc(arg);
        let result = record.invoke(self, arg)?;
        Ok(self.state().heap.take(result)?)
    }

    /// Run destructors queued by closures that became unreachable.
    pub fn drain_finalizers(&mut self) -> anyhow::Result<usize> {
        let mut ran = 0;
        loop {
            let pending = self.state().closures.take_pending();
            if pending.is_empty() {
                return Ok(ran);
            }
            for p in pending {
                trace!(closure = p.closure, "running queued closure destructor");
                self.call_destructor(p.dtor, p.data, p.meta)?;
                ran += 1;
            }
        }
    }

    fn table_func(&mut self, index: u32) -> anyhow::Result<wasmtime::Func> {
        let table = self
            .exports
            .table
            .ok_or_else(|| BridgeError::MissingExport(self.state_ref().config.exports.table.clone()))?;
        match table.get(&mut self.cx, index.into()) {
            Some(Ref::Func(Some(func))) => Ok(func),
            _ => Err(BridgeError::BadTableEntry(index).into()),
        }
    }

    /// Current size of guest memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.exports.memory.data_size(&self.cx)
    }

    /// Grow guest memory by `pages`, returning the previous page count.
    pub fn grow_memory(&mut self, pages: u64) -> anyhow::Result<u64> {
        self.exports.memory.grow(&mut self.cx, pages)
    }
}

impl GuestAllocator for GuestCx<'_> {
    fn malloc(&mut self, size: u32, align: u32) -> anyhow::Result<u32> {
        let ptr = self.exports.malloc.call(&mut self.cx, (size as i32, align as i32))?;
        Ok(ptr as u32)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> anyhow::Result<u32> {
        let Some(realloc) = self.exports.realloc.clone() else {
            let name = self.state_ref().config.exports.realloc.clone();
            return Err(BridgeError::MissingExport(name).into());
        };
        let ptr = realloc.call(
            &mut self.cx,
            (ptr as i32, old_size as i32, new_size as i32, align as i32),
        )?;
        Ok(ptr as u32)
    }

    fn can_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }

    fn bytes(&mut self) -> anyhow::Result<ByteView<'_>> {
        let (mem, state) = self.exports.memory.data_and_store_mut(&mut self.cx);
        Ok(state.views.bytes(mem))
    }
}

impl GuestCallbacks for GuestCx<'_> {
    fn call_closure(&mut self, invoke: u32, data: u32, meta: u32, arg: u32) -> anyhow::Result<u32> {
        let func = self.table_func(invoke)?;
        let typed = func.typed::<(i32, i32, i32), i32>(&self.cx)?;
        let handle = typed.call(&mut self.cx, (data as i32, meta as i32, arg as i32))?;
        Ok(handle as u32)
    }

    fn call_destructor(&mut self, dtor: u32, data: u32, meta: u32) -> anyhow::Result<()> {
        let func = self.table_func(dtor)?;
        let typed = func.typed::<(i32, i32), ()>(&self.cx)?;
        typed.call(&mut self.cx, (data as i32, meta as i32))?;
        Ok(())
    }
}
