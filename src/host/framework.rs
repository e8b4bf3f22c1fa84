//! Host framework trait and the types that cross it

use std::ffi::{c_void, CStr};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::abi::{Context, DLManagedTensor};
use crate::error::BridgeResult;

/// Engine task body: `(run_ctx, param)`
pub type EngineSyncFunc = unsafe extern "C" fn(rctx: *mut c_void, param: *mut c_void);

/// Engine callback releasing a task's parameter block
pub type EngineFuncParamDeleter = unsafe extern "C" fn(param: *mut c_void);

/// Opaque host tensor handle
///
/// Ordered by address so handle sets can be sorted and merged.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorHandle(pub *mut c_void);

// SAFETY: the handle is an identity owned by the host; the bridge only
// passes it back to host primitives, which are callable from any thread.
unsafe impl Send for TensorHandle {}
unsafe impl Sync for TensorHandle {}

impl TensorHandle {
    pub fn from_addr(addr: usize) -> Self {
        TensorHandle(addr as *mut c_void)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorHandle({:p})", self.0)
    }
}

/// One push onto the host engine
///
/// `ctx` and `param` point into the parameter block; the engine may run and
/// release the task before `push_sync` returns, so they stay raw pointers.
#[derive(Debug)]
pub struct EngineTask<'a> {
    pub run: EngineSyncFunc,
    pub param: *mut c_void,
    pub deleter: EngineFuncParamDeleter,
    pub ctx: *const Context,
    pub const_handles: &'a [TensorHandle],
    pub mutable_handles: &'a [TensorHandle],
    pub priority: i32,
    pub name: Option<&'a CStr>,
}

/// Primitives the bridge needs from the host tensor framework
pub trait HostFramework: Send + Sync {
    /// New handle aliasing `src`'s storage with its own reference count
    fn shallow_copy(&self, src: TensorHandle) -> BridgeResult<TensorHandle>;

    /// Drop a handle produced by [`HostFramework::shallow_copy`]
    fn free(&self, handle: TensorHandle) -> BridgeResult<()>;

    /// Device the tensor lives on
    fn context(&self, handle: TensorHandle) -> BridgeResult<Context>;

    /// Export as a DLPack managed tensor; the caller runs its deleter
    fn to_managed_tensor(&self, handle: TensorHandle) -> BridgeResult<NonNull<DLManagedTensor>>;

    /// Enqueue a task on the async engine
    ///
    /// On success the engine owns `task.param` and will call
    /// `task.deleter` on it. On error ownership stays with the caller.
    fn push_sync(&self, task: EngineTask<'_>) -> BridgeResult<()>;
}

/// Where an async wrapper finds its host
#[derive(Clone)]
pub enum HostBinding {
    /// Whatever `RegisterMXAPI` installed, resolved on every call
    Registered,
    /// A host owned by the wrapper
    Fixed(Arc<dyn HostFramework>),
}

impl HostBinding {
    pub fn resolve(&self) -> BridgeResult<Arc<dyn HostFramework>> {
        match self {
            HostBinding::Registered => crate::host::registered(),
            HostBinding::Fixed(host) => Ok(Arc::clone(host)),
        }
    }
}

impl fmt::Debug for HostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostBinding::Registered => write!(f, "HostBinding::Registered"),
            HostBinding::Fixed(_) => write!(f, "HostBinding::Fixed"),
        }
    }
}
