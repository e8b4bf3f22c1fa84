//! DLPack tensor interchange layouts
//!
//! The bridge never builds these itself; the host produces a
//! [`DLManagedTensor`] per tensor argument and the user function receives a
//! pointer to its `dl_tensor` field. Fields written by foreign code are kept
//! as plain integers rather than Rust enums.

use std::ffi::c_void;
use std::os::raw::c_int;

/// DLPack device type codes
pub mod device_type {
    pub const CPU: i32 = 1;
    pub const GPU: i32 = 2;
    pub const CPU_PINNED: i32 = 3;
}

/// DLPack data type codes
pub mod dtype_code {
    pub const INT: u8 = 0;
    pub const UINT: u8 = 1;
    pub const FLOAT: u8 = 2;
}

/// DLPack device context
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLContext {
    pub device_type: c_int,
    pub device_id: c_int,
}

impl DLContext {
    pub fn cpu() -> Self {
        DLContext {
            device_type: device_type::CPU,
            device_id: 0,
        }
    }

    pub fn gpu(device_id: i32) -> Self {
        DLContext {
            device_type: device_type::GPU,
            device_id,
        }
    }
}

/// DLPack data type descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLDataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl DLDataType {
    pub fn float32() -> Self {
        DLDataType {
            code: dtype_code::FLOAT,
            bits: 32,
            lanes: 1,
        }
    }

    pub fn int64() -> Self {
        DLDataType {
            code: dtype_code::INT,
            bits: 64,
            lanes: 1,
        }
    }
}

/// DLPack tensor descriptor
#[repr(C)]
#[derive(Debug)]
pub struct DLTensor {
    pub data: *mut c_void,
    pub ctx: DLContext,
    pub ndim: c_int,
    pub dtype: DLDataType,
    pub shape: *mut i64,
    pub strides: *mut i64,
    pub byte_offset: u64,
}

/// DLPack tensor carrying its own deleter
///
/// Whoever receives one must call `deleter` exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct DLManagedTensor {
    pub dl_tensor: DLTensor,
    pub manager_ctx: *mut c_void,
    pub deleter: Option<unsafe extern "C" fn(*mut DLManagedTensor)>,
}

impl DLManagedTensor {
    /// Pointer to the inner tensor descriptor, suitable for a packed argument
    ///
    /// # Safety
    ///
    /// `this` must point at a live managed tensor.
    pub unsafe fn dl_tensor_ptr(this: *mut DLManagedTensor) -> *mut DLTensor {
        std::ptr::addr_of_mut!((*this).dl_tensor)
    }

    /// Invoke the deleter, if any
    ///
    /// # Safety
    ///
    /// `this` must point at a live managed tensor whose deleter has not run.
    /// The pointer is dangling afterwards.
    pub unsafe fn release(this: *mut DLManagedTensor) {
        if let Some(deleter) = (*this).deleter {
            deleter(this);
        }
    }
}
