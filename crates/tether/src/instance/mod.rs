//! Instantiation and the host-facing bridge handle.
//!
//! [`Bridge::init_sync`] and [`Bridge::init`] converge on one finalization
//! step: bind the export table, reset the memory view cache, then run the
//! guest's start export. Both return the existing export table when the
//! bridge is already active.

use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};
use wasmtime::{AsContextMut, Memory, Store, Table, TypedFunc, Val, WasmParams, WasmResults};

use crate::Engine;
use crate::error::{BridgeError, HostError};
use crate::heap::HandleTable;
use crate::linker::Linker;
use crate::memory::MemoryViews;
use crate::module::GuestModule;
use crate::store::{BridgeState, Extensions, GuestCx};
use crate::string::StringCodec;
use crate::tasks::{EventLoop, Microtask};
use crate::value::HostValue;

/// Guest exports bound after instantiation.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<(i32, i32), i32>,
    pub realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    pub free: Option<TypedFunc<(i32, i32, i32), ()>>,
    pub exn_store: TypedFunc<i32, ()>,
    pub start: Option<TypedFunc<(), ()>>,
    pub table: Option<Table>,
}

/// Where module bytes come from.
pub enum ModuleSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Module(GuestModule),
    Stream(Pin<Box<dyn AsyncRead>>),
}

impl ModuleSource {
    async fn load(self, engine: &Engine) -> Result<GuestModule, anyhow::Error> {
        let bytes = match self {
            ModuleSource::Module(module) => return Ok(module),
            ModuleSource::Bytes(bytes) => bytes,
            ModuleSource::Path(path) => tokio::fs::read(&path).await?,
            ModuleSource::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                buf
            }
        };
        GuestModule::from_bytes(engine, &bytes)
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        ModuleSource::Path(path)
    }
}

impl From<GuestModule> for ModuleSource {
    fn from(module: GuestModule) -> Self {
        ModuleSource::Module(module)
    }
}

/// One guest instance wired to a host environment.
pub struct Bridge {
    engine: Engine,
    linker: Linker,
    store: Store<BridgeState>,
    instance: Option<wasmtime::Instance>,
}

impl Bridge {
    pub fn new(engine: &Engine, linker: Linker) -> Self {
        let state = BridgeState::new(engine.config().clone());
        Self {
            engine: engine.clone(),
            linker,
            store: Store::new(engine.vm(), state),
            instance: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.instance.is_some()
    }

    /// Instantiate from an already compiled module.
    pub fn init_sync(&mut self, module: &GuestModule) -> Result<&GuestExports, anyhow::Error> {
        if self.instance.is_none() {
            self.instantiate(module)?;
        }
        self.exports()
    }

    /// Obtain module bytes, compile and instantiate.
    pub async fn init(&mut self, source: impl Into<ModuleSource>) -> Result<&GuestExports, anyhow::Error> {
        if self.instance.is_none() {
            let module = source.into().load(&self.engine).await?;
            self.instantiate(&module)?;
        }
        self.exports()
    }

    fn exports(&self) -> Result<&GuestExports, anyhow::Error> {
        Ok(self
            .store
            .data()
            .exports
            .as_ref()
            .ok_or(BridgeError::NotInitialized)?)
    }

    fn instantiate(&mut self, module: &GuestModule) -> Result<(), anyhow::Error> {
        let names = self.engine.config().exports.clone();
        module.check_exports(&names)?;

        let (vm_linker, capabilities) = self.linker.build(module)?;
        self.store.data_mut().capabilities = capabilities;
        let instance = vm_linker.instantiate(&mut self.store, &module.inner)?;

        let store = &mut self.store;
        let memory = instance
            .get_memory(&mut *store, &names.memory)
            .ok_or_else(|| BridgeError::MissingExport(names.memory.clone()))?;
        let exports = GuestExports {
            memory,
            malloc: instance.get_typed_func(&mut *store, &names.malloc)?,
            realloc: optional_func(&instance, &mut *store, &names.realloc)?,
            free: optional_func(&instance, &mut *store, &names.free)?,
            exn_store: instance.get_typed_func(&mut *store, &names.exn_store)?,
            start: optional_func(&instance, &mut *store, &names.start)?,
            table: instance.get_table(&mut *store, &names.table),
        };
        self.instance = Some(instance);
        self.finalize(exports)
    }

    fn finalize(&mut self, exports: GuestExports) -> Result<(), anyhow::Error> {
        let start = exports.start.clone();
        let state = self.store.data_mut();
        state.exports = Some(exports);
        state.views.reset();
        debug!(
            capabilities = state.capabilities.len(),
            "guest instantiated"
        );
        if let Some(start) = start {
            start.call(&mut self.store, ())?;
        }
        self.drain_finalizers()?;
        Ok(())
    }

    fn guest(&mut self) -> Result<GuestCx<'_>, BridgeError> {
        GuestCx::new(self.store.as_context_mut())
    }

    /// Call an exported function by name (typed API).
    pub fn call<A: WasmParams, R: WasmResults>(&mut self, name: &str, args: A) -> Result<R, anyhow::Error> {
        let func = self.export_func(name)?.typed::<A, R>(&self.store)?;
        let result = func.call(&mut self.store, args);
        self.settle_call(result)
    }

    /// Call an exported function by name (dynamic API).
    pub fn call_dynamic(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, anyhow::Error> {
        let func = self.export_func(name)?;
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];
        let outcome = func.call(&mut self.store, args, &mut results);
        self.settle_call(outcome)?;
        Ok(results)
    }

    /// Drain finalizers after an export call. The call's own failure wins
    /// over a destructor failure, which is then only logged.
    fn settle_call<R>(&mut self, result: Result<R, anyhow::Error>) -> Result<R, anyhow::Error> {
        let drained = self.drain_finalizers();
        match (result, drained) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(dtor)) => {
                warn!("closure destructor failed after a failed call: {dtor:#}");
                Err(err)
            }
        }
    }

    fn export_func(&mut self, name: &str) -> Result<wasmtime::Func, anyhow::Error> {
        let instance = self.instance.ok_or(BridgeError::NotInitialized)?;
        instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| anyhow::anyhow!("export {name} not found"))
    }

    /// Run destructors of closures that became unreachable.
    pub fn drain_finalizers(&mut self) -> Result<usize, anyhow::Error> {
        if self.store.data().closures.pending_len() == 0 {
            return Ok(0);
        }
        self.guest()?.drain_finalizers()
    }

    pub fn heap(&self) -> &HandleTable {
        &self.store.data().heap
    }

    pub fn heap_mut(&mut self) -> &mut HandleTable {
        &mut self.store.data_mut().heap
    }

    pub fn views(&self) -> &MemoryViews {
        &self.store.data().views
    }

    pub fn codec(&self) -> &StringCodec {
        &self.store.data().codec
    }

    pub fn events(&self) -> &EventLoop {
        &self.store.data().events
    }

    pub fn extensions(&self) -> &Extensions {
        &self.store.data().extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.store.data_mut().extensions
    }

    pub fn extension<T: 'static>(&self) -> Option<&T> {
        self.store.data().extensions.get::<T>()
    }

    /// Copy a string into guest memory; the guest owns the buffer.
    pub fn pass_string(&mut self, value: &str) -> Result<(u32, u32), anyhow::Error> {
        self.guest()?.write_string(value)
    }

    pub fn read_string(&mut self, ptr: u32, len: u32) -> Result<String, anyhow::Error> {
        Ok(self.guest()?.read_string(ptr, len)?)
    }

    pub fn read_bytes(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, anyhow::Error> {
        Ok(self.guest()?.read_bytes(ptr, len)?)
    }

    /// Return a buffer to the guest allocator, if it exports one.
    pub fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<(), anyhow::Error> {
        self.guest()?.free(ptr, size, align)
    }

    /// Call the function value behind `handle` with `arg`.
    pub fn invoke(&mut self, handle: u32, arg: HostValue) -> Result<HostValue, anyhow::Error> {
        let callee = self.heap().get(handle);
        let Some(record) = callee.as_function() else {
            return Err(BridgeError::Host(HostError::type_error(format!(
                "{} is not a function",
                callee.type_name()
            )))
            .into());
        };
        let result = self.guest()?.invoke_closure(record, arg);
        self.drain_finalizers()?;
        result
    }

    /// Drain the microtask queue, including tasks queued while draining.
    pub fn run_microtasks(&mut self) -> Result<usize, anyhow::Error> {
        let mut ran = 0;
        while let Some(task) = self.store.data_mut().events.pop_microtask() {
            self.run_microtask(task)?;
            ran += 1;
        }
        self.drain_finalizers()?;
        Ok(ran)
    }

    fn run_microtask(&mut self, task: Microtask) -> Result<(), anyhow::Error> {
        let Microtask {
            callback,
            arg,
            settle,
        } = task;
        let outcome = self.guest()?.invoke_closure(&callback, arg);
        let Some(derived) = settle else {
            return outcome.map(drop);
        };
        let events = &mut self.store.data_mut().events;
        match outcome {
            Ok(value) => derived.resolve(value, events),
            Err(err) => {
                warn!(error = %err, "promise reaction failed");
                derived.reject(HostError::error(format!("{err:#}")), events);
            }
        }
        Ok(())
    }

    /// Advance virtual time by `elapsed`, firing due timers in order and
    /// draining microtasks after each one. Returns the number of timers
    /// fired.
    pub fn run_timers(&mut self, elapsed: Duration) -> Result<usize, anyhow::Error> {
        let deadline = self.store.data().events.deadline_after(elapsed);
        let mut fired = 0;
        self.run_microtasks()?;
        while let Some(timer) = self.store.data_mut().events.pop_due_timer(deadline) {
            debug!(timer = timer.id, "firing timer");
            let callback = Rc::clone(&timer.callback);
            drop(timer);
            self.guest()?.invoke_closure(&callback, HostValue::Undefined)?;
            drop(callback);
            fired += 1;
            self.run_microtasks()?;
        }
        self.store.data_mut().events.advance_to(deadline);
        Ok(fired)
    }

    /// Grow guest memory by `pages`, returning the previous size in pages.
    pub fn grow_memory(&mut self, pages: u64) -> Result<u64, anyhow::Error> {
        self.guest()?.grow_memory(pages)
    }

    pub fn memory_size(&mut self) -> Result<usize, anyhow::Error> {
        Ok(self.guest()?.memory_size())
    }

    /// Raw view of guest memory for inspection.
    pub fn memory(&self) -> Result<&[u8], anyhow::Error> {
        let exports = self.exports()?;
        Ok(exports.memory.data(&self.store))
    }
}

fn optional_func<P: WasmParams, R: WasmResults>(
    instance: &wasmtime::Instance,
    store: &mut Store<BridgeState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>, anyhow::Error> {
    match instance.get_func(&mut *store, name) {
        Some(func) => Ok(Some(func.typed(&*store)?)),
        None => Ok(None),
    }
}
