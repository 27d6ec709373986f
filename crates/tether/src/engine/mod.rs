use wasmparser::{Validator, WasmFeatures};

use crate::config::BridgeConfig;

/// Shared compilation configuration.
///
/// Owns the underlying VM engine and the bridge configuration every module
/// and bridge created from it inherits.
#[derive(Clone)]
pub struct Engine {
    inner: wasmtime::Engine,
    features: WasmFeatures,
    config: BridgeConfig,
}

impl Engine {
    /// Create an engine with a validated bridge configuration.
    pub fn new(config: BridgeConfig) -> Result<Self, anyhow::Error> {
        config.validate()?;
        Ok(Self {
            inner: wasmtime::Engine::default(),
            features: bridge_features(),
            config,
        })
    }

    /// Create a new validator with the engine's features.
    pub fn new_validator(&self) -> Validator {
        Validator::new_with_features(self.features)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn vm(&self) -> &wasmtime::Engine {
        &self.inner
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            inner: wasmtime::Engine::default(),
            features: bridge_features(),
            config: BridgeConfig::default(),
        }
    }
}

/// Guests rely on bulk memory for `memory.copy` in their allocators and on
/// a funcref table for closure trampolines.
fn bridge_features() -> WasmFeatures {
    let mut features = WasmFeatures::default();
    features.set(WasmFeatures::BULK_MEMORY, true);
    features.set(WasmFeatures::REFERENCE_TYPES, true);
    features.set(WasmFeatures::MULTI_VALUE, true);
    features
}
