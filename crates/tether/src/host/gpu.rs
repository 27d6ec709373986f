use std::collections::BTreeMap;

use super::not_a;
use crate::linker::{Capability, Linker, Param, Ret};
use crate::tasks::Deferred;
use crate::value::{HostObject, HostValue};

/// A graphics adapter description.
#[derive(Debug, Clone)]
pub struct Adapter {
    pub name: String,
}

impl HostObject for Adapter {
    fn class_name(&self) -> &str {
        "GPUAdapter"
    }
}

pub const POWER_PREFERENCES: &[&str] = &["low-power", "high-performance"];

pub const TEXTURE_FORMATS: &[&str] = &[
    "r8unorm",
    "r8snorm",
    "rg8unorm",
    "rgba8unorm",
    "rgba8unorm-srgb",
    "bgra8unorm",
    "bgra8unorm-srgb",
    "rgba16float",
    "rgba32float",
    "depth24plus",
    "depth32float",
];

/// GPU host state.
///
/// `adapters` are offered to `gpu_request_adapter`, best first; with none,
/// the request resolves to null. `bind_groups` records the dynamic offsets
/// last set for each group index.
#[derive(Debug)]
pub struct Gpu {
    pub adapters: Vec<String>,
    pub power_preference: Option<String>,
    pub canvas_format: String,
    pub bind_groups: BTreeMap<u32, Vec<u32>>,
}

impl Default for Gpu {
    fn default() -> Self {
        Self {
            adapters: vec!["tether software adapter".to_string()],
            power_preference: None,
            canvas_format: "bgra8unorm".to_string(),
            bind_groups: BTreeMap::new(),
        }
    }
}

pub(super) fn register(linker: &mut Linker) {
    linker.define(Capability::new("gpu_request_adapter", &[], Ret::Handle, |cx, _| {
        let gpu = cx.extensions.get_or_insert_with(Gpu::default);
        let value = match gpu.adapters.first() {
            Some(name) => HostValue::object(Adapter { name: name.clone() }),
            None => HostValue::Null,
        };
        Ok(HostValue::Object(Deferred::resolved(value)))
    }));
    linker.define(
        Capability::new("gpu_adapter_name", &[Param::Handle], Ret::Str, |_, args| {
            let adapter = args[0]
                .downcast_ref::<Adapter>()
                .ok_or_else(|| not_a(&args[0], "a GPUAdapter"))?;
            Ok(HostValue::from(adapter.name.as_str()))
        })
        .fallible(),
    );
    linker.define(Capability::new(
        "gpu_set_power_preference",
        &[Param::Enum(POWER_PREFERENCES)],
        Ret::Unit,
        |cx, args| {
            let gpu = cx.extensions.get_or_insert_with(Gpu::default);
            gpu.power_preference = args[0].as_str().map(str::to_owned);
            Ok(HostValue::Undefined)
        },
    ));
    linker.define(Capability::new(
        "gpu_preferred_canvas_format",
        &[],
        Ret::Enum(TEXTURE_FORMATS),
        |cx, _| {
            let gpu = cx.extensions.get_or_insert_with(Gpu::default);
            Ok(HostValue::from(gpu.canvas_format.as_str()))
        },
    ));
    linker.define(Capability::new(
        "gpu_set_bind_group",
        &[Param::I32, Param::U32Array],
        Ret::Unit,
        |cx, args| {
            let index = args[0].as_f64().unwrap_or_default() as u32;
            let offsets = args[1].as_words().unwrap_or_default().to_vec();
            let gpu = cx.extensions.get_or_insert_with(Gpu::default);
            gpu.bind_groups.insert(index, offsets);
            Ok(HostValue::Undefined)
        },
    ));
}
