//! Common test utilities for the dispatch tests
//!
//! - [`PackedCall`] builds packed argument buffers
//! - [`CAPI_HOST`] is a [`RecordingHost`] exposed through `extern "C"`
//!   primitives, so the C entry points can be driven end to end
//!
//! Anything touching the process-wide host slot, registry or counters must
//! run under `#[serial]`.

#![allow(dead_code)]

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::sync::Arc;

use once_cell::sync::Lazy;
use mxtvm_bridge::abi::{type_code, Context, DLManagedTensor, PackedArgs, PackedValue};
use mxtvm_bridge::host::testing::RecordingHost;
use mxtvm_bridge::host::{EngineFuncParamDeleter, EngineSyncFunc, EngineTask, HostFramework};
use mxtvm_bridge::TensorHandle;

/// Owned packed argument buffer
#[derive(Debug, Default, Clone)]
pub struct PackedCall {
    pub values: Vec<PackedValue>,
    pub type_codes: Vec<c_int>,
}

impl PackedCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(mut self, handle: TensorHandle) -> Self {
        self.values.push(PackedValue::from_handle(handle.as_ptr()));
        self.type_codes.push(type_code::FRAMEWORK_NDARRAY);
        self
    }

    pub fn int(mut self, value: i64) -> Self {
        self.values.push(PackedValue::from_i64(value));
        self.type_codes.push(type_code::INT);
        self
    }

    pub fn float(mut self, value: f64) -> Self {
        self.values.push(PackedValue::from_f64(value));
        self.type_codes.push(type_code::FLOAT);
        self
    }

    pub fn with_code(mut self, value: PackedValue, code: c_int) -> Self {
        self.values.push(value);
        self.type_codes.push(code);
        self
    }

    pub fn args(&self) -> PackedArgs<'_> {
        PackedArgs::new(&self.values, &self.type_codes).expect("parallel buffers")
    }
}

/// Host behind the `extern "C"` primitives below
pub static CAPI_HOST: Lazy<Arc<RecordingHost>> = Lazy::new(RecordingHost::new);

fn status<T>(result: mxtvm_bridge::BridgeResult<T>) -> c_int {
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

pub unsafe extern "C" fn mock_shallow_copy(src: *mut c_void, out: *mut *mut c_void) -> c_int {
    match CAPI_HOST.shallow_copy(TensorHandle(src)) {
        Ok(copy) => {
            *out = copy.as_ptr();
            0
        }
        Err(_) => -1,
    }
}

pub unsafe extern "C" fn mock_free(handle: *mut c_void) -> c_int {
    status(CAPI_HOST.free(TensorHandle(handle)))
}

pub unsafe extern "C" fn mock_get_context(
    handle: *mut c_void,
    out_dev_type: *mut c_int,
    out_dev_id: *mut c_int,
) -> c_int {
    match CAPI_HOST.context(TensorHandle(handle)) {
        Ok(ctx) => {
            *out_dev_type = ctx.dev_type.as_raw();
            *out_dev_id = ctx.dev_id;
            0
        }
        Err(_) => -1,
    }
}

pub unsafe extern "C" fn mock_to_dlpack(handle: *mut c_void, out: *mut *mut DLManagedTensor) -> c_int {
    match CAPI_HOST.to_managed_tensor(TensorHandle(handle)) {
        Ok(managed) => {
            *out = managed.as_ptr();
            0
        }
        Err(_) => -1,
    }
}

unsafe fn handle_slice<'a>(handles: *mut *mut c_void, len: c_int) -> &'a [TensorHandle] {
    if len <= 0 || handles.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(handles as *const TensorHandle, len as usize)
    }
}

pub unsafe extern "C" fn mock_push_sync(
    sync_func: EngineSyncFunc,
    func_param: *mut c_void,
    deleter: EngineFuncParamDeleter,
    ctx_handle: *const c_void,
    const_nds_handle: *mut *mut c_void,
    num_const_nds: c_int,
    mutable_nds_handle: *mut *mut c_void,
    num_mutable_nds: c_int,
    _prop_handle: *const c_void,
    priority: c_int,
    opr_name: *const c_char,
) -> c_int {
    let task = EngineTask {
        run: sync_func,
        param: func_param,
        deleter,
        ctx: ctx_handle as *const Context,
        const_handles: handle_slice(const_nds_handle, num_const_nds),
        mutable_handles: handle_slice(mutable_nds_handle, num_mutable_nds),
        priority,
        name: if opr_name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(opr_name))
        },
    };
    match CAPI_HOST.push_sync(task) {
        Ok(()) => 0,
        Err(_) => -2,
    }
}

/// Install the mock primitives through `RegisterMXAPI`
pub fn register_capi_host() {
    unsafe {
        mxtvm_bridge::capi::RegisterMXAPI(
            Some(mock_shallow_copy),
            Some(mock_free),
            Some(mock_get_context),
            Some(mock_to_dlpack),
            Some(mock_push_sync),
        );
    }
}
