//! Exported C entry points
//!
//! The bridge has no error channel towards C callers: any error or panic
//! reaching an entry point aborts the process after logging it.
//!
//! # Safety
//!
//! Pointer arguments must satisfy the usual C contract: strings are
//! NUL-terminated, arrays hold the advertised number of elements, and
//! returned `PackedFunc` pointers are only passed back to
//! [`MXBridgeFuncCall`].

#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use crate::abi::{PackedArgs, PackedCFunc, PackedFunc, PackedRet, PackedValue};
use crate::bridge::{registry, stream, AsyncWrapper};
use crate::config;
use crate::error::{self, BridgeError, BridgeResult};
use crate::host::{
    self, EnginePushSyncNDFn, HostApi, HostBinding, NDArrayFreeFn, NDArrayGetContextFn,
    NDArrayToDLPackFn, ShallowCopyNDArrayFn,
};
use crate::invalid_argument;
use crate::logging;

/// Run an entry point body, aborting on error or panic
fn guard<T>(entry: &'static str, body: impl FnOnce() -> BridgeResult<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => error::or_fatal(result),
        Err(payload) => error::fatal(&error::from_panic(entry, payload)),
    }
}

/// Install the host framework primitives, replacing any previous set
#[no_mangle]
pub unsafe extern "C" fn RegisterMXAPI(
    shallow_copy_ndarray: Option<ShallowCopyNDArrayFn>,
    ndarray_free: Option<NDArrayFreeFn>,
    ndarray_get_context: Option<NDArrayGetContextFn>,
    ndarray_to_dlpack: Option<NDArrayToDLPackFn>,
    engine_push_sync_nd: Option<EnginePushSyncNDFn>,
) {
    logging::init_logging_default();
    guard("RegisterMXAPI", || {
        let missing = |what: &str| invalid_argument!("RegisterMXAPI: {} is null", what);
        let api = HostApi {
            shallow_copy_ndarray: shallow_copy_ndarray.ok_or_else(|| missing("MXShallowCopyNDArray"))?,
            ndarray_free: ndarray_free.ok_or_else(|| missing("MXNDArrayFree"))?,
            ndarray_get_context: ndarray_get_context.ok_or_else(|| missing("MXNDArrayGetContext"))?,
            ndarray_to_dlpack: ndarray_to_dlpack.ok_or_else(|| missing("MXNDArrayToDLPack"))?,
            engine_push_sync_nd: engine_push_sync_nd.ok_or_else(|| missing("MXEnginePushSyncND"))?,
        };
        host::register(Arc::new(api))?;
        tracing::debug!("host API registered");
        Ok(())
    })
}

/// Return the wrapped packed function registered under `cname`
///
/// The first call for a name wraps `pfunc` with `const_loc[0..num_const)`
/// as read-only tensor positions; later calls return the same pointer and
/// ignore their other arguments.
#[no_mangle]
pub unsafe extern "C" fn GetMXNetFunc(
    cname: *const c_char,
    pfunc: Option<PackedCFunc>,
    num_const: c_int,
    const_loc: *const c_int,
) -> *const PackedFunc {
    guard("GetMXNetFunc", || {
        if !host::is_registered() {
            return Err(BridgeError::HostNotRegistered);
        }
        if cname.is_null() {
            return Err(invalid_argument!("GetMXNetFunc: null function name"));
        }
        let cname = unsafe { CStr::from_ptr(cname) };
        let name = cname
            .to_str()
            .map_err(|_| invalid_argument!("GetMXNetFunc: function name is not UTF-8"))?;

        let func = registry::global().get_or_create(name, || {
            let pfunc =
                pfunc.ok_or_else(|| invalid_argument!("GetMXNetFunc: null function for {}", name))?;
            let const_loc = unsafe { const_positions(num_const, const_loc) }?;
            let config = config::global()?;
            // SAFETY: C packed functions carry no resource handle here.
            let user = unsafe { PackedFunc::from_c(pfunc, ptr::null_mut()) };
            let wrapper = AsyncWrapper::new(HostBinding::Registered, user, const_loc, &config)?
                .with_name(cname.to_owned());
            tracing::debug!(name, const_loc = ?wrapper.const_locations(), "wrapping async function");
            Ok(wrapper.into_packed_func())
        })?;
        Ok(func as *const PackedFunc)
    })
}

unsafe fn const_positions<'a>(num_const: c_int, const_loc: *const c_int) -> BridgeResult<&'a [i32]> {
    match num_const {
        n if n < 0 => Err(invalid_argument!("num_const {} is negative", n)),
        0 => Ok(&[]),
        _ if const_loc.is_null() => Err(invalid_argument!(
            "const_loc is null with num_const {}",
            num_const
        )),
        n => Ok(std::slice::from_raw_parts(const_loc, n as usize)),
    }
}

/// Call a function returned by [`GetMXNetFunc`]; returns 0
#[no_mangle]
pub unsafe extern "C" fn MXBridgeFuncCall(
    func: *const PackedFunc,
    values: *mut PackedValue,
    type_codes: *mut c_int,
    num_args: c_int,
) -> c_int {
    guard("MXBridgeFuncCall", || {
        let func = unsafe { func.as_ref() }
            .ok_or_else(|| invalid_argument!("MXBridgeFuncCall: null function"))?;
        let args = unsafe { PackedArgs::from_raw(values, type_codes, num_args) }?;
        let mut ret = PackedRet::default();
        func.call_packed(args, &mut ret)?;
        Ok(0)
    })
}

/// Read the stream bound to the calling thread; null when unbound
#[no_mangle]
pub unsafe extern "C" fn MXBridgeGetStream(out_dev_id: *mut c_int, out_stream: *mut *mut c_void) -> c_int {
    let state = stream::current_stream();
    if let Some(dev_id) = unsafe { out_dev_id.as_mut() } {
        *dev_id = state.dev_id;
    }
    if let Some(out) = unsafe { out_stream.as_mut() } {
        *out = state.stream;
    }
    0
}
