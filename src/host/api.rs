//! Host primitives installed over the C ABI
//!
//! `RegisterMXAPI` hands the bridge five function pointers exported by the
//! host framework's C API. They live in one process-wide slot; registering
//! again replaces the previous set.

use std::ffi::{c_char, c_void};
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::{Arc, RwLock};

use crate::abi::{Context, DLManagedTensor};
use crate::error::{check_host, BridgeError, BridgeResult};
use crate::host::framework::{
    EngineFuncParamDeleter, EngineSyncFunc, EngineTask, HostFramework, TensorHandle,
};

/// `int MXShallowCopyNDArray(NDArrayHandle src, NDArrayHandle* out)`
pub type ShallowCopyNDArrayFn = unsafe extern "C" fn(src: *mut c_void, out: *mut *mut c_void) -> c_int;

/// `int MXNDArrayFree(NDArrayHandle handle)`
pub type NDArrayFreeFn = unsafe extern "C" fn(handle: *mut c_void) -> c_int;

/// `int MXNDArrayGetContext(NDArrayHandle, int* dev_type, int* dev_id)`
pub type NDArrayGetContextFn =
    unsafe extern "C" fn(handle: *mut c_void, out_dev_type: *mut c_int, out_dev_id: *mut c_int) -> c_int;

/// `int MXNDArrayToDLPack(NDArrayHandle, DLManagedTensorHandle*)`
pub type NDArrayToDLPackFn =
    unsafe extern "C" fn(handle: *mut c_void, out: *mut *mut DLManagedTensor) -> c_int;

/// `int MXEnginePushSyncND(...)`
pub type EnginePushSyncNDFn = unsafe extern "C" fn(
    sync_func: EngineSyncFunc,
    func_param: *mut c_void,
    deleter: EngineFuncParamDeleter,
    ctx_handle: *const c_void,
    const_nds_handle: *mut *mut c_void,
    num_const_nds: c_int,
    mutable_nds_handle: *mut *mut c_void,
    num_mutable_nds: c_int,
    prop_handle: *const c_void,
    priority: c_int,
    opr_name: *const c_char,
) -> c_int;

/// Function pointers exported by the host framework
#[derive(Debug, Clone, Copy)]
pub struct HostApi {
    pub shallow_copy_ndarray: ShallowCopyNDArrayFn,
    pub ndarray_free: NDArrayFreeFn,
    pub ndarray_get_context: NDArrayGetContextFn,
    pub ndarray_to_dlpack: NDArrayToDLPackFn,
    pub engine_push_sync_nd: EnginePushSyncNDFn,
}

impl HostFramework for HostApi {
    fn shallow_copy(&self, src: TensorHandle) -> BridgeResult<TensorHandle> {
        let mut out: *mut c_void = ptr::null_mut();
        let code = unsafe { (self.shallow_copy_ndarray)(src.as_ptr(), &mut out) };
        check_host("MXShallowCopyNDArray", code)?;
        Ok(TensorHandle(out))
    }

    fn free(&self, handle: TensorHandle) -> BridgeResult<()> {
        let code = unsafe { (self.ndarray_free)(handle.as_ptr()) };
        check_host("MXNDArrayFree", code)
    }

    fn context(&self, handle: TensorHandle) -> BridgeResult<Context> {
        let mut dev_type: c_int = 0;
        let mut dev_id: c_int = 0;
        let code = unsafe { (self.ndarray_get_context)(handle.as_ptr(), &mut dev_type, &mut dev_id) };
        check_host("MXNDArrayGetContext", code)?;
        Context::from_raw(dev_type, dev_id)
    }

    fn to_managed_tensor(&self, handle: TensorHandle) -> BridgeResult<NonNull<DLManagedTensor>> {
        let mut out: *mut DLManagedTensor = ptr::null_mut();
        let code = unsafe { (self.ndarray_to_dlpack)(handle.as_ptr(), &mut out) };
        check_host("MXNDArrayToDLPack", code)?;
        NonNull::new(out).ok_or(BridgeError::HostCallFailed {
            call: "MXNDArrayToDLPack",
            code: 0,
        })
    }

    fn push_sync(&self, task: EngineTask<'_>) -> BridgeResult<()> {
        // TensorHandle is repr(transparent), so the slices are NDArrayHandle arrays.
        let code = unsafe {
            (self.engine_push_sync_nd)(
                task.run,
                task.param,
                task.deleter,
                task.ctx.cast(),
                task.const_handles.as_ptr() as *mut *mut c_void,
                task.const_handles.len() as c_int,
                task.mutable_handles.as_ptr() as *mut *mut c_void,
                task.mutable_handles.len() as c_int,
                ptr::null(),
                task.priority,
                task.name.map_or(ptr::null(), |name| name.as_ptr()),
            )
        };
        if code != 0 {
            return Err(BridgeError::EnginePushFailed(code));
        }
        Ok(())
    }
}

/// Process-wide host slot
static HOST: RwLock<Option<Arc<dyn HostFramework>>> = RwLock::new(None);

/// Install the host primitives, replacing any previous set
pub fn register(host: Arc<dyn HostFramework>) -> BridgeResult<()> {
    let mut slot = HOST.write()?;
    if slot.is_some() {
        tracing::debug!("replacing previously registered host API");
    }
    *slot = Some(host);
    Ok(())
}

/// Currently installed host primitives
pub fn registered() -> BridgeResult<Arc<dyn HostFramework>> {
    HOST.read()?
        .as_ref()
        .map(Arc::clone)
        .ok_or(BridgeError::HostNotRegistered)
}

pub fn is_registered() -> bool {
    HOST.read().map(|slot| slot.is_some()).unwrap_or(false)
}
