//! Binary interfaces shared with the host framework and the packed-function
//! runtime
//!
//! Everything in here is `#[repr(C)]` and crosses the library boundary.

pub mod context;
pub mod dlpack;
pub mod packed;

pub use context::{Context, DeviceType, RawContext, RunContext};
pub use dlpack::{DLContext, DLDataType, DLManagedTensor, DLTensor};
pub use packed::{type_code, PackedArgs, PackedCFunc, PackedFunc, PackedRet, PackedValue};
