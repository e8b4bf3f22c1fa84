//! Host framework shim
//!
//! The bridge reaches the host tensor framework only through five
//! primitives: shallow-copy a tensor, free it, query its device, export it
//! as a DLPack managed tensor, and push a task onto the async engine.
//! [`HostFramework`] is the seam; [`HostApi`] implements it over the C
//! function pointers installed by `RegisterMXAPI`.

mod api;
mod framework;
pub mod testing;

pub use api::{
    is_registered, register, registered, EnginePushSyncNDFn, HostApi, NDArrayFreeFn,
    NDArrayGetContextFn, NDArrayToDLPackFn, ShallowCopyNDArrayFn,
};
pub use framework::{
    EngineFuncParamDeleter, EngineSyncFunc, EngineTask, HostBinding, HostFramework, TensorHandle,
};
