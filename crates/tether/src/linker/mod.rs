//! Named import registry for guest instantiation.
//!
//! Host capabilities are described as data: a name, the marshal kind of
//! each parameter, the marshal kind of the result, whether failures are
//! delivered to the guest's exception slot, and the host function itself.
//! The [`Linker`] resolves a module's imports against these descriptions
//! and the fixed set of bridge intrinsics, and lowers them onto the VM
//! linker.

mod intrinsics;
mod marshal;

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::debug;
use wasmparser::ValType;

use crate::Engine;
use crate::error::HostError;
use crate::module::GuestModule;
use crate::parse::{ExternKind, Signature};
use crate::store::{BridgeState, HostCx};
use crate::value::HostValue;

pub use intrinsics::INTRINSICS;

/// How a capability parameter crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// One i32, seen by the host as a number.
    I32,
    /// One f64.
    F64,
    /// One i32, zero is false.
    Bool,
    /// One i32 handle, dereferenced without being released.
    Handle,
    /// `(ptr, len)` of UTF-8 text in guest memory.
    Str,
    /// `(ptr, len)` of raw bytes in guest memory.
    Bytes,
    /// One i32 indexing a table of strings.
    Enum(&'static [&'static str]),
    /// `(ptr, len)` of `len` u32 words; `ptr` is 4-aligned.
    U32Array,
}

impl Param {
    fn core_types(self) -> &'static [ValType] {
        match self {
            Param::I32 | Param::Bool | Param::Handle | Param::Enum(_) => &[ValType::I32],
            Param::F64 => &[ValType::F64],
            Param::Str | Param::Bytes | Param::U32Array => &[ValType::I32, ValType::I32],
        }
    }
}

/// How a capability result crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ret {
    Unit,
    I32,
    F64,
    Bool,
    /// A fresh handle the guest owns.
    Handle,
    /// Like `Handle`, but `undefined` and `null` both lower to handle 0.
    OptionalHandle,
    /// Text written to guest memory; `(ptr, len)` is stored at a return
    /// pointer passed as the first parameter.
    Str,
    /// A string lowered to its index in the table. Strings missing from the
    /// table lower to the table length.
    Enum(&'static [&'static str]),
}

impl Ret {
    fn uses_retptr(self) -> bool {
        matches!(self, Ret::Str)
    }

    fn core_types(self) -> &'static [ValType] {
        match self {
            Ret::Unit | Ret::Str => &[],
            Ret::I32 | Ret::Bool | Ret::Handle | Ret::OptionalHandle | Ret::Enum(_) => {
                &[ValType::I32]
            }
            Ret::F64 => &[ValType::F64],
        }
    }
}

/// Host function behind a capability.
pub type HostFn = Rc<dyn Fn(&mut HostCx<'_>, Vec<HostValue>) -> Result<HostValue, HostError>>;

/// One importable host operation.
pub struct Capability {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Ret,
    /// Route failures to the guest's exception slot instead of trapping.
    pub fallible: bool,
    pub func: HostFn,
}

impl Capability {
    pub fn new(
        name: impl Into<String>,
        params: &[Param],
        ret: Ret,
        func: impl Fn(&mut HostCx<'_>, Vec<HostValue>) -> Result<HostValue, HostError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
            ret,
            fallible: false,
            func: Rc::new(func),
        }
    }

    pub fn fallible(mut self) -> Self {
        self.fallible = true;
        self
    }

    /// Core signature the guest must import this capability with.
    pub fn signature(&self) -> Signature {
        let mut params = Vec::new();
        if self.ret.uses_retptr() {
            params.push(ValType::I32);
        }
        for p in &self.params {
            params.extend_from_slice(p.core_types());
        }
        Signature {
            params,
            results: self.ret.core_types().to_vec(),
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field("fallible", &self.fallible)
            .finish()
    }
}

/// A named import registry that resolves guest imports during
/// instantiation.
///
/// # Examples
///
/// ```ignore
/// let mut linker = Linker::new(&engine);
/// linker.define(Capability::new("console_log", &[Param::Str], Ret::Unit, |_, args| {
///     println!("{}", args[0].as_str().unwrap_or_default());
///     Ok(HostValue::Undefined)
/// }));
/// let mut bridge = Bridge::new(&engine, linker);
/// bridge.init_sync(&module)?;
/// ```
pub struct Linker {
    engine: Engine,
    entries: HashMap<String, Rc<Capability>>,
}

impl Linker {
    /// Create an empty linker.
    pub fn new(engine: &Engine) -> Self {
        Linker {
            engine: engine.clone(),
            entries: HashMap::new(),
        }
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn define(&mut self, capability: Capability) -> &mut Self {
        self.entries
            .insert(capability.name.clone(), Rc::new(capability));
        self
    }

    /// Check whether an import name is already registered.
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name).map(|c| c.as_ref())
    }

    /// Registered capability names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Resolve a module's imports and build the VM linker for it.
    ///
    /// For each import declared by the module:
    /// 1. Intrinsic imports must name a known intrinsic.
    /// 2. Capability imports must name a registered capability and match its
    ///    core signature.
    /// 3. Anything else is an error.
    ///
    /// Returns the VM linker and the capabilities in thunk-index order; the
    /// caller installs the latter in the store.
    pub(crate) fn build(
        &self,
        module: &GuestModule,
    ) -> Result<(wasmtime::Linker<BridgeState>, Vec<Rc<Capability>>), anyhow::Error> {
        let names = &self.engine.config().imports;
        let mut vm = wasmtime::Linker::new(self.engine.vm());
        intrinsics::define(&mut vm, &names.intrinsics)?;

        let mut used: Vec<Rc<Capability>> = Vec::new();
        let mut defined = HashSet::new();
        for import in &module.abi().imports {
            if import.kind != ExternKind::Func {
                anyhow::bail!(
                    "import '{}::{}' must be a function",
                    import.module,
                    import.name
                );
            }
            if import.module == names.intrinsics {
                if !INTRINSICS.contains(&import.name.as_str()) {
                    anyhow::bail!("import '{}::{}' was not found", import.module, import.name);
                }
                continue;
            }
            if import.module != names.host {
                anyhow::bail!("import '{}::{}' was not found", import.module, import.name);
            }
            let Some(capability) = self.entries.get(&import.name) else {
                anyhow::bail!("import '{}::{}' was not found", import.module, import.name);
            };
            let expected = capability.signature();
            if import.signature.as_ref() != Some(&expected) {
                anyhow::bail!(
                    "import '{}::{}' has signature {}, expected {}",
                    import.module,
                    import.name,
                    import.signature.clone().unwrap_or_default(),
                    expected
                );
            }
            if !defined.insert(import.name.clone()) {
                continue;
            }

            let index = used.len();
            used.push(Rc::clone(capability));
            let ty = marshal::func_type(self.engine.vm(), &expected);
            vm.func_new(&names.host, &import.name, ty, move |mut caller, params, results| {
                marshal::dispatch(&mut caller, index, params, results)
            })?;
            debug!(capability = %import.name, fallible = capability.fallible, "linked capability");
        }
        Ok((vm, used))
    }
}
