//! mxtvm-bridge - asynchronous operator dispatch bridge
//!
//! Wraps a type-erased packed function so that a host tensor framework's
//! asynchronous engine can schedule it: tensor arguments are shallow-copied
//! and exposed as DLPack views, read/write dependency sets are derived from
//! the operator's const argument positions, and GPU work runs under the
//! stream the engine hands to the task.
//!
//! The crate builds as a `cdylib` exporting `RegisterMXAPI` and
//! `GetMXNetFunc` (see [`capi`]) and as an `rlib` for Rust hosts.

#![allow(clippy::too_many_arguments)] // Host engine push takes eleven arguments
#![allow(clippy::missing_safety_doc)] // C entry points documented at module level
#![allow(clippy::new_without_default)]

pub mod abi;
pub mod bridge;
pub mod capi;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod stats;

pub use abi::{
    Context, DeviceType, PackedArgs, PackedFunc, PackedRet, PackedValue, RawContext, RunContext,
};
pub use bridge::{
    deduplicate_handles, AsyncWrapper, DependencySets, FunctionRegistry, InvocationFunctor,
};
pub use config::{BridgeConfig, ConstLocPolicy};
pub use error::{BridgeError, BridgeResult, ErrorCategory};
pub use host::{HostBinding, HostFramework, TensorHandle};
