//! Async dispatch core
//!
//! - [`stream`]: per-thread stream binding
//! - [`deps`]: read/write dependency derivation
//! - [`functor`]: marshalling and execution of one call
//! - [`wrapper`]: engine push and trampolines
//! - [`registry`]: name to wrapped function interning

pub mod deps;
pub mod functor;
pub mod registry;
pub mod stream;
pub mod wrapper;

pub use deps::{deduplicate_handles, DependencySets};
pub use functor::InvocationFunctor;
pub use registry::{function_idcode, idcode_hash, FunctionRegistry};
pub use stream::{current_stream, set_stream_func, StreamState};
pub use wrapper::{deleter_trampoline, sync_func_trampoline, AsyncWrapper};
