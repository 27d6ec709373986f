//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML document (or
//! [`BridgeConfig::default`]) yields a working bridge. Import module names
//! and export names are configurable so the bridge can be pointed at guests
//! built by different toolchains.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default values for configuration
mod defaults {
    /// Cumulative decoded bytes after which the decoder is replaced.
    pub fn decode_ceiling() -> u64 { 2_146_435_072 }
    pub fn initial_handles() -> usize { 128 }
    pub fn strict_handles() -> bool { false }

    pub fn intrinsics_module() -> String { "__bridge".to_string() }
    pub fn host_module() -> String { "host".to_string() }

    pub fn memory() -> String { "memory".to_string() }
    pub fn malloc() -> String { "__bridge_malloc".to_string() }
    pub fn realloc() -> String { "__bridge_realloc".to_string() }
    pub fn free() -> String { "__bridge_free".to_string() }
    pub fn exn_store() -> String { "__bridge_exn_store".to_string() }
    pub fn start() -> String { "__bridge_start".to_string() }
    pub fn table() -> String { "__indirect_function_table".to_string() }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Names of the import modules the guest links against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportNames {
    /// Module providing the fixed bridge intrinsics.
    #[serde(default = "defaults::intrinsics_module")]
    pub intrinsics: String,
    /// Module providing capability thunks.
    #[serde(default = "defaults::host_module")]
    pub host: String,
}

impl Default for ImportNames {
    fn default() -> Self {
        Self {
            intrinsics: defaults::intrinsics_module(),
            host: defaults::host_module(),
        }
    }
}

/// Names of the guest exports the bridge binds after instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportNames {
    #[serde(default = "defaults::memory")]
    pub memory: String,
    #[serde(default = "defaults::malloc")]
    pub malloc: String,
    /// Optional; without it strings are written with a single exact-size
    /// allocation.
    #[serde(default = "defaults::realloc")]
    pub realloc: String,
    #[serde(default = "defaults::free")]
    pub free: String,
    #[serde(default = "defaults::exn_store")]
    pub exn_store: String,
    #[serde(default = "defaults::start")]
    pub start: String,
    #[serde(default = "defaults::table")]
    pub table: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            memory: defaults::memory(),
            malloc: defaults::malloc(),
            realloc: defaults::realloc(),
            free: defaults::free(),
            exn_store: defaults::exn_store(),
            start: defaults::start(),
            table: defaults::table(),
        }
    }
}

/// Configuration for one bridge instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Replace the text decoder once this many bytes have been decoded.
    #[serde(default = "defaults::decode_ceiling")]
    pub decode_ceiling: u64,
    /// Initial capacity of the handle table, sentinels included.
    #[serde(default = "defaults::initial_handles")]
    pub initial_handles: usize,
    /// Report dereference or release of dead handles instead of reading
    /// them as `undefined`.
    #[serde(default = "defaults::strict_handles")]
    pub strict_handles: bool,
    #[serde(default)]
    pub imports: ImportNames,
    #[serde(default)]
    pub exports: ExportNames,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            decode_ceiling: defaults::decode_ceiling(),
            initial_handles: defaults::initial_handles(),
            strict_handles: defaults::strict_handles(),
            imports: ImportNames::default(),
            exports: ExportNames::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.decode_ceiling == 0 {
            return Err(ConfigError::InvalidValue {
                key: "decode_ceiling".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let names = [
            ("imports.intrinsics", &self.imports.intrinsics),
            ("imports.host", &self.imports.host),
            ("exports.memory", &self.exports.memory),
            ("exports.malloc", &self.exports.malloc),
            ("exports.exn_store", &self.exports.exn_store),
        ];
        for (key, value) in names {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.imports.intrinsics == self.imports.host {
            return Err(ConfigError::InvalidValue {
                key: "imports.host".to_string(),
                reason: "must differ from imports.intrinsics".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.decode_ceiling, 2_146_435_072);
        assert!(!config.strict_handles);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            decode_ceiling = 4096
            strict_handles = true

            [exports]
            malloc = "alloc"
            "#,
        )
        .unwrap();
        assert_eq!(config.decode_ceiling, 4096);
        assert!(config.strict_handles);
        assert_eq!(config.exports.malloc, "alloc");
        assert_eq!(config.exports.exn_store, "__bridge_exn_store");
        assert_eq!(config.imports.host, "host");
    }

    #[test]
    fn rejects_zero_ceiling() {
        let err = BridgeConfig::from_toml_str("decode_ceiling = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "decode_ceiling"));
    }

    #[test]
    fn rejects_colliding_import_modules() {
        let err = BridgeConfig::from_toml_str(
            r#"
            [imports]
            intrinsics = "env"
            host = "env"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("imports.host"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "initial_handles = 8\n").unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.initial_handles, 8);
    }
}
