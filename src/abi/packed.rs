//! Packed-call ABI
//!
//! A packed call is a parallel pair of arrays: `values[i]` holds an 8-byte
//! union payload and `type_codes[i]` says which member is live. Packed
//! functions are type-erased callables over such a pair; [`PackedFunc`]
//! wraps either a Rust closure or a C function pointer behind one
//! cheaply-clonable handle.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

use crate::abi::dlpack::{DLContext, DLDataType};
use crate::error::{BridgeError, BridgeResult};
use crate::invalid_argument;

/// Argument type codes understood by the packed-function runtime
pub mod type_code {
    pub const INT: i32 = 0;
    pub const UINT: i32 = 1;
    pub const FLOAT: i32 = 2;
    pub const HANDLE: i32 = 3;
    pub const NULL: i32 = 4;
    /// First non-POD code; everything below it is plain data
    pub const TVM_TYPE: i32 = 5;
    pub const TVM_CONTEXT: i32 = 6;
    /// `DLTensor*` payload
    pub const ARRAY_HANDLE: i32 = 7;
    pub const NODE_HANDLE: i32 = 8;
    pub const MODULE_HANDLE: i32 = 9;
    pub const FUNC_HANDLE: i32 = 10;
    pub const STR: i32 = 11;
    pub const BYTES: i32 = 12;
    pub const NDARRAY_CONTAINER: i32 = 13;
    /// Host framework NDArray handle
    pub const FRAMEWORK_NDARRAY: i32 = 19;

    /// Plain data that may cross an asynchronous call unchanged
    pub fn is_pod(code: i32) -> bool {
        (0..TVM_TYPE).contains(&code)
    }

    pub fn name(code: i32) -> &'static str {
        match code {
            INT => "int",
            UINT => "uint",
            FLOAT => "float",
            HANDLE => "handle",
            NULL => "null",
            TVM_TYPE => "TVMType",
            TVM_CONTEXT => "TVMContext",
            ARRAY_HANDLE => "ArrayHandle",
            NODE_HANDLE => "NodeHandle",
            MODULE_HANDLE => "ModuleHandle",
            FUNC_HANDLE => "FunctionHandle",
            STR => "str",
            BYTES => "bytes",
            NDARRAY_CONTAINER => "NDArrayContainer",
            FRAMEWORK_NDARRAY => "NDArray",
            _ => "unknown",
        }
    }
}

/// Union payload of one packed argument
#[repr(C)]
#[derive(Clone, Copy)]
pub union PackedValue {
    pub v_int64: i64,
    pub v_float64: f64,
    pub v_handle: *mut c_void,
    pub v_str: *const c_char,
    pub v_type: DLDataType,
    pub v_ctx: DLContext,
}

impl PackedValue {
    pub fn from_i64(value: i64) -> Self {
        PackedValue { v_int64: value }
    }

    pub fn from_f64(value: f64) -> Self {
        PackedValue { v_float64: value }
    }

    pub fn from_handle(handle: *mut c_void) -> Self {
        PackedValue { v_handle: handle }
    }

    pub fn null() -> Self {
        PackedValue { v_int64: 0 }
    }

    pub fn from_dtype(dtype: DLDataType) -> Self {
        let mut value = PackedValue::null();
        value.v_type = dtype;
        value
    }

    /// Raw 64-bit image of the payload
    pub fn bits(&self) -> u64 {
        // SAFETY: every constructor initialises all eight bytes.
        unsafe { self.v_int64 as u64 }
    }
}

impl Default for PackedValue {
    fn default() -> Self {
        PackedValue::null()
    }
}

impl fmt::Debug for PackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedValue({:#018x})", self.bits())
    }
}

/// Borrowed view of a packed argument buffer
#[derive(Debug, Clone, Copy)]
pub struct PackedArgs<'a> {
    values: &'a [PackedValue],
    type_codes: &'a [c_int],
}

impl<'a> PackedArgs<'a> {
    pub fn new(values: &'a [PackedValue], type_codes: &'a [c_int]) -> BridgeResult<Self> {
        if values.len() != type_codes.len() {
            return Err(invalid_argument!(
                "{} values but {} type codes",
                values.len(),
                type_codes.len()
            ));
        }
        Ok(PackedArgs { values, type_codes })
    }

    pub fn empty() -> Self {
        PackedArgs {
            values: &[],
            type_codes: &[],
        }
    }

    /// Borrow a buffer handed over the C ABI
    ///
    /// # Safety
    ///
    /// When `num_args > 0`, both pointers must reference `num_args`
    /// initialised elements that outlive `'a`.
    pub unsafe fn from_raw(
        values: *const PackedValue,
        type_codes: *const c_int,
        num_args: c_int,
    ) -> BridgeResult<Self> {
        if num_args < 0 {
            return Err(invalid_argument!("num_args {} is negative", num_args));
        }
        if num_args == 0 {
            return Ok(PackedArgs::empty());
        }
        if values.is_null() || type_codes.is_null() {
            return Err(invalid_argument!(
                "null argument buffer with num_args {}",
                num_args
            ));
        }
        let len = num_args as usize;
        Ok(PackedArgs {
            values: std::slice::from_raw_parts(values, len),
            type_codes: std::slice::from_raw_parts(type_codes, len),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &'a [PackedValue] {
        self.values
    }

    pub fn type_codes(&self) -> &'a [c_int] {
        self.type_codes
    }

    fn slot(&self, index: usize) -> BridgeResult<(PackedValue, c_int)> {
        match (self.values.get(index), self.type_codes.get(index)) {
            (Some(value), Some(code)) => Ok((*value, *code)),
            _ => Err(invalid_argument!(
                "argument {} out of range for {} arguments",
                index,
                self.len()
            )),
        }
    }

    /// Integer argument (`int` or `uint` code)
    pub fn int64(&self, index: usize) -> BridgeResult<i64> {
        match self.slot(index)? {
            (value, type_code::INT) | (value, type_code::UINT) => Ok(unsafe { value.v_int64 }),
            (_, code) => Err(invalid_argument!(
                "argument {} expected int, got {}",
                index,
                type_code::name(code)
            )),
        }
    }

    /// Floating-point argument
    pub fn float64(&self, index: usize) -> BridgeResult<f64> {
        match self.slot(index)? {
            (value, type_code::FLOAT) => Ok(unsafe { value.v_float64 }),
            (_, code) => Err(invalid_argument!(
                "argument {} expected float, got {}",
                index,
                type_code::name(code)
            )),
        }
    }

    /// Pointer-like argument; `null` yields a null pointer
    pub fn handle(&self, index: usize) -> BridgeResult<*mut c_void> {
        match self.slot(index)? {
            (_, type_code::NULL) => Ok(std::ptr::null_mut()),
            (value, type_code::HANDLE)
            | (value, type_code::ARRAY_HANDLE)
            | (value, type_code::FRAMEWORK_NDARRAY) => Ok(unsafe { value.v_handle }),
            (_, code) => Err(invalid_argument!(
                "argument {} expected handle, got {}",
                index,
                type_code::name(code)
            )),
        }
    }
}

/// Return slot of a packed call
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PackedRet {
    pub value: PackedValue,
    pub type_code: c_int,
}

impl Default for PackedRet {
    fn default() -> Self {
        PackedRet {
            value: PackedValue::null(),
            type_code: type_code::NULL,
        }
    }
}

/// C packed function: `(args, type_codes, num_args, ret, resource_handle) -> status`
pub type PackedCFunc = unsafe extern "C" fn(
    args: *mut PackedValue,
    type_codes: *mut c_int,
    num_args: c_int,
    ret: *mut c_void,
    resource_handle: *mut c_void,
) -> c_int;

type PackedBody = dyn Fn(PackedArgs<'_>, &mut PackedRet) -> BridgeResult<()> + Send + Sync;

/// Shared, type-erased packed function
#[derive(Clone)]
pub struct PackedFunc {
    body: Arc<PackedBody>,
}

impl PackedFunc {
    /// Wrap a Rust closure
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(PackedArgs<'_>, &mut PackedRet) -> BridgeResult<()> + Send + Sync + 'static,
    {
        PackedFunc {
            body: Arc::new(body),
        }
    }

    /// Wrap a C function pointer
    ///
    /// The callee receives a private copy of the argument arrays.
    ///
    /// # Safety
    ///
    /// `func` must be callable from any thread, and `resource_handle` must
    /// stay valid for as long as the returned function (or a clone) lives.
    pub unsafe fn from_c(func: PackedCFunc, resource_handle: *mut c_void) -> Self {
        let resource = resource_handle as usize;
        PackedFunc::new(move |args, ret| {
            let mut values = args.values().to_vec();
            let mut codes = args.type_codes().to_vec();
            let code = func(
                values.as_mut_ptr(),
                codes.as_mut_ptr(),
                values.len() as c_int,
                (ret as *mut PackedRet).cast(),
                resource as *mut c_void,
            );
            if code != 0 {
                return Err(BridgeError::FunctionFailed { code });
            }
            Ok(())
        })
    }

    pub fn call_packed(&self, args: PackedArgs<'_>, ret: &mut PackedRet) -> BridgeResult<()> {
        (self.body)(args, ret)
    }

    /// Call with owned arrays and return the result slot
    pub fn invoke(&self, values: &[PackedValue], type_codes: &[c_int]) -> BridgeResult<PackedRet> {
        let mut ret = PackedRet::default();
        self.call_packed(PackedArgs::new(values, type_codes)?, &mut ret)?;
        Ok(ret)
    }

    /// Whether both handles share one underlying callable
    pub fn ptr_eq(&self, other: &PackedFunc) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for PackedFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedFunc({:p})", Arc::as_ptr(&self.body) as *const ())
    }
}
