//! Host framework device context and engine run context

use std::ffi::c_void;
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Host framework device type
///
/// Values match the host's `Context::DeviceType` enum bit for bit.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu = 1,
    Gpu = 2,
    CpuPinned = 3,
}

impl DeviceType {
    /// Parse the integer the host reports through `get_context`
    pub fn from_raw(raw: i32) -> BridgeResult<Self> {
        match raw {
            1 => Ok(DeviceType::Cpu),
            2 => Ok(DeviceType::Gpu),
            3 => Ok(DeviceType::CpuPinned),
            other => Err(BridgeError::UnsupportedDevice(other)),
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::CpuPinned => "cpu_pinned",
        }
    }
}

/// Device placement of a tensor or a task
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    pub dev_type: DeviceType,
    pub dev_id: i32,
}

impl Context {
    pub fn new(dev_type: DeviceType, dev_id: i32) -> Self {
        Context { dev_type, dev_id }
    }

    pub fn cpu(dev_id: i32) -> Self {
        Context::new(DeviceType::Cpu, dev_id)
    }

    pub fn gpu(dev_id: i32) -> Self {
        Context::new(DeviceType::Gpu, dev_id)
    }

    pub fn cpu_pinned(dev_id: i32) -> Self {
        Context::new(DeviceType::CpuPinned, dev_id)
    }

    /// Build from the raw pair the host returns
    pub fn from_raw(dev_type: i32, dev_id: i32) -> BridgeResult<Self> {
        Ok(Context::new(DeviceType::from_raw(dev_type)?, dev_id))
    }

    /// Whether tasks on this context need a stream bound
    pub fn is_gpu(&self) -> bool {
        self.dev_type == DeviceType::Gpu
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.dev_type.name(), self.dev_id)
    }
}

/// Context as laid out in memory the engine owns
///
/// The engine may report device types the bridge does not know (its
/// shared-memory CPU type is 5), so the device type stays a plain integer
/// until [`RawContext::context`] checks it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawContext {
    pub dev_type: i32,
    pub dev_id: i32,
}

impl RawContext {
    pub fn context(&self) -> BridgeResult<Context> {
        Context::from_raw(self.dev_type, self.dev_id)
    }
}

impl From<Context> for RawContext {
    fn from(ctx: Context) -> Self {
        RawContext {
            dev_type: ctx.dev_type.as_raw(),
            dev_id: ctx.dev_id,
        }
    }
}

impl fmt::Display for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.context() {
            Ok(ctx) => fmt::Display::fmt(&ctx, f),
            Err(_) => write!(f, "device{}({})", self.dev_type, self.dev_id),
        }
    }
}

/// Context the engine passes to a running task
///
/// `stream` is an indirection: it points at the variable holding the
/// device stream, not at the stream itself.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub ctx: RawContext,
    pub stream: *mut c_void,
}

impl RunContext {
    pub fn new(ctx: RawContext, stream: *mut c_void) -> Self {
        RunContext { ctx, stream }
    }

    /// Run context for CPU tasks
    pub fn cpu(dev_id: i32) -> Self {
        RunContext::new(Context::cpu(dev_id).into(), std::ptr::null_mut())
    }

    /// Run context for a GPU task; `stream_slot` points at the stream variable
    pub fn gpu(dev_id: i32, stream_slot: *mut *mut c_void) -> Self {
        RunContext::new(Context::gpu(dev_id).into(), stream_slot.cast())
    }

    /// Checked device context of the task
    pub fn context(&self) -> BridgeResult<Context> {
        self.ctx.context()
    }

    /// Dereference the stream indirection
    ///
    /// # Safety
    ///
    /// `self.stream` must be null or point at a live `*mut c_void`.
    pub unsafe fn stream_ptr(&self) -> BridgeResult<*mut c_void> {
        if self.stream.is_null() {
            return Err(BridgeError::StreamUnavailable);
        }
        Ok(*(self.stream as *const *mut c_void))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_from_raw() {
        assert_eq!(DeviceType::from_raw(1).unwrap(), DeviceType::Cpu);
        assert_eq!(DeviceType::from_raw(2).unwrap(), DeviceType::Gpu);
        assert_eq!(DeviceType::from_raw(3).unwrap(), DeviceType::CpuPinned);
        assert!(matches!(
            DeviceType::from_raw(7),
            Err(BridgeError::UnsupportedDevice(7))
        ));
    }

    #[test]
    fn test_context_display() {
        assert_eq!(Context::gpu(1).to_string(), "gpu(1)");
        assert_eq!(Context::cpu(0).to_string(), "cpu(0)");
        assert_eq!(Context::cpu_pinned(0).to_string(), "cpu_pinned(0)");
    }

    #[test]
    fn test_context_layout_matches_host() {
        assert_eq!(std::mem::size_of::<Context>(), 8);
        assert_eq!(std::mem::size_of::<DeviceType>(), 4);
        assert_eq!(std::mem::size_of::<RawContext>(), 8);
    }

    #[test]
    fn test_unknown_engine_device_type_is_rejected() {
        // engine memory holding the shared-memory CPU type
        let words: [i32; 2] = [5, 0];
        let raw = unsafe { *(words.as_ptr() as *const RawContext) };
        assert_eq!(raw, RawContext { dev_type: 5, dev_id: 0 });
        assert!(matches!(raw.context(), Err(BridgeError::UnsupportedDevice(5))));
        assert_eq!(raw.to_string(), "device5(0)");

        let rctx = RunContext::new(raw, std::ptr::null_mut());
        assert!(matches!(rctx.context(), Err(BridgeError::UnsupportedDevice(5))));
        assert_eq!(RunContext::gpu(1, std::ptr::null_mut()).context().unwrap(), Context::gpu(1));
        assert_eq!(RawContext::from(Context::gpu(1)).to_string(), "gpu(1)");
    }

    #[test]
    fn test_run_context_stream_indirection() {
        let mut stream_var: *mut c_void = 0xdead_0000usize as *mut c_void;
        let rctx = RunContext::gpu(0, &mut stream_var);
        let stream = unsafe { rctx.stream_ptr() }.unwrap();
        assert_eq!(stream as usize, 0xdead_0000);

        let cpu = RunContext::cpu(0);
        assert!(matches!(
            unsafe { cpu.stream_ptr() },
            Err(BridgeError::StreamUnavailable)
        ));
    }
}
