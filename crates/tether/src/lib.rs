mod closure;
mod config;
mod engine;
mod error;
mod heap;
pub mod host;
mod instance;
mod linker;
mod memory;
mod module;
mod parse;
mod store;
mod string;
mod tasks;
mod value;

pub use closure::{ClosureRecord, ClosureRegistry, GuestCallbacks, PendingDestructor};
pub use config::{BridgeConfig, ConfigError, ExportNames, ImportNames};
pub use engine::Engine;
pub use error::{BridgeError, HostError};
pub use heap::{FALSE, HandleTable, NULL, RESERVED, TRUE, UNDEFINED};
pub use instance::{Bridge, GuestExports, ModuleSource};
pub use linker::{Capability, HostFn, INTRINSICS, Linker, Param, Ret};
pub use memory::{ByteView, FloatView, MemoryViews, View, ViewKind, WordView};
pub use module::GuestModule;
pub use parse::{ExportDecl, ExternKind, ImportDecl, ModuleAbi, Signature};
pub use store::{BridgeState, Extensions, GuestCx, HostCx};
pub use string::{GuestAllocator, StringCodec, Utf8Decoder, write_bytes, write_string};
pub use tasks::{Deferred, EventLoop, Microtask, PromiseState, Timer};
pub use value::{AsAny, HostObject, HostValue};
