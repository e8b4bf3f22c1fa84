//! Per-thread stream state
//!
//! **The stream binding is PER-THREAD.** The engine runs a GPU task on one
//! of its worker threads and hands it a stream; the bridge records
//! `(device_id, stream)` in thread-local slots through the stream-setter
//! packed function, runs the user function, then clears the slots so the
//! next task on the same worker does not inherit the stream.
//!
//! Compute libraries read the binding with [`current_stream`] (or
//! `MXBridgeGetStream` over the C ABI) from inside the user function.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;

use crate::abi::dlpack::device_type;
use crate::abi::{type_code, PackedFunc, PackedValue};
use crate::error::BridgeResult;
use crate::stats;

thread_local! {
    static DEV_ID: Cell<i32> = const { Cell::new(-1) };
    static STREAM: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// Stream bound to the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    /// Device of the last binding, -1 if none ever happened
    pub dev_id: i32,
    /// Bound stream, null when unbound
    pub stream: *mut c_void,
}

impl StreamState {
    pub fn is_bound(&self) -> bool {
        !self.stream.is_null()
    }
}

/// Read the calling thread's stream binding
pub fn current_stream() -> StreamState {
    StreamState {
        dev_id: DEV_ID.with(Cell::get),
        stream: STREAM.with(Cell::get),
    }
}

fn store(dev_id: i32, stream: *mut c_void) {
    DEV_ID.with(|cell| cell.set(dev_id));
    STREAM.with(|cell| cell.set(stream));
}

/// Default stream-setter: `(device_type, device_id, stream)` into the
/// thread-local slots
pub fn set_stream_func() -> PackedFunc {
    PackedFunc::new(|args, _ret| {
        let dev_id = args.int64(1)?;
        let stream = args.handle(2)?;
        store(dev_id as i32, stream);
        Ok(())
    })
}

fn call_setter(setter: &PackedFunc, dev_id: i32, stream: *mut c_void) -> BridgeResult<()> {
    let values = [
        PackedValue::from_i64(device_type::GPU as i64),
        PackedValue::from_i64(dev_id as i64),
        PackedValue::from_handle(stream),
    ];
    let stream_code = if stream.is_null() {
        type_code::NULL
    } else {
        type_code::HANDLE
    };
    let codes = [type_code::INT, type_code::INT, stream_code];
    setter.invoke(&values, &codes).map(|_| ())
}

/// Scope guard binding a stream through a stream-setter
///
/// Binds on creation and unbinds (null stream) on drop, so the setter runs
/// exactly twice even if the guarded call fails.
pub(crate) struct StreamBinding<'a> {
    setter: &'a PackedFunc,
    dev_id: i32,
}

impl<'a> StreamBinding<'a> {
    pub(crate) fn bind(setter: &'a PackedFunc, dev_id: i32, stream: *mut c_void) -> BridgeResult<Self> {
        call_setter(setter, dev_id, stream)?;
        stats::global().record_stream_bind();
        tracing::trace!(dev_id, ?stream, "stream bound");
        Ok(StreamBinding { setter, dev_id })
    }
}

impl Drop for StreamBinding<'_> {
    fn drop(&mut self) {
        stats::global().record_stream_unbind();
        if let Err(e) = call_setter(self.setter, self.dev_id, ptr::null_mut()) {
            tracing::error!(dev_id = self.dev_id, "failed to unbind stream: {}", e);
        }
    }
}
