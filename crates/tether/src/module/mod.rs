use std::path::Path;
use std::sync::Arc;

use crate::Engine;
use crate::config::ExportNames;
use crate::error::BridgeError;
use crate::parse::{ExternKind, ModuleAbi, parse};

/// A validated and compiled guest module (immutable, cheap to clone).
#[derive(Clone)]
pub struct GuestModule {
    pub(crate) inner: wasmtime::Module,
    pub(crate) abi: Arc<ModuleAbi>,
}

impl GuestModule {
    /// Parse a WAT string into a module.
    pub fn new(engine: &Engine, wat: &str) -> Result<Self, anyhow::Error> {
        let bytes = wat::parse_str(wat)?;
        Self::from_bytes(engine, &bytes)
    }

    /// Create a module from raw WASM bytes. Text-format input is accepted
    /// too.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, anyhow::Error> {
        let bytes = wat::parse_bytes(bytes)?;
        let abi = parse(engine, &bytes)?;
        let inner = wasmtime::Module::from_binary(engine.vm(), &bytes)?;
        Ok(GuestModule {
            inner,
            abi: Arc::new(abi),
        })
    }

    /// Read and compile a module from the filesystem.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(engine, &bytes)
    }

    /// Imports and exports as declared by the module.
    pub fn abi(&self) -> &ModuleAbi {
        &self.abi
    }

    /// Verify the exports the bridge cannot run without.
    pub fn check_exports(&self, names: &ExportNames) -> Result<(), BridgeError> {
        let required = [
            (&names.memory, ExternKind::Memory),
            (&names.malloc, ExternKind::Func),
            (&names.exn_store, ExternKind::Func),
        ];
        for (name, kind) in required {
            if !self.abi.has_export(name, kind) {
                return Err(BridgeError::MissingExport(name.clone()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("imports", &self.abi.imports.len())
            .field("exports", &self.abi.exports.len())
            .finish()
    }
}
