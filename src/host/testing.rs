//! In-process host used by the test suites
//!
//! [`RecordingHost`] implements [`HostFramework`] without a real tensor
//! framework:
//! - tensors are fake addresses with a device context attached
//! - shallow copies, frees and managed-tensor exports are counted
//! - pushed tasks wait in a queue until the test runs them, optionally on
//!   another thread, the way an engine worker would
//! - push and export failures can be injected

use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::abi::dlpack::{DLContext, DLDataType, DLManagedTensor, DLTensor};
use crate::abi::{Context, DeviceType, RunContext};
use crate::error::{BridgeError, BridgeResult};
use crate::host::framework::{
    EngineFuncParamDeleter, EngineSyncFunc, EngineTask, HostBinding, HostFramework, TensorHandle,
};

/// One accepted `push_sync`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub ctx: Context,
    pub reads: Vec<TensorHandle>,
    pub writes: Vec<TensorHandle>,
    pub priority: i32,
    pub name: Option<String>,
}

struct PendingTask {
    run: EngineSyncFunc,
    param: *mut c_void,
    deleter: EngineFuncParamDeleter,
}

// SAFETY: the parameter block is owned by the queue until the task runs,
// and the bridge's functor is Send.
unsafe impl Send for PendingTask {}

struct SendRunContext(RunContext);

// SAFETY: the stream slot outlives the worker thread, which is joined
// before `run_all_on_thread` returns.
unsafe impl Send for SendRunContext {}

#[derive(Default)]
struct HostState {
    next_addr: usize,
    contexts: HashMap<TensorHandle, Context>,
    /// shallow copy -> original
    copies: HashMap<TensorHandle, TensorHandle>,
    freed: Vec<TensorHandle>,
    pushes: Vec<PushRecord>,
    push_status: i32,
    export_budget: Option<usize>,
}

/// Recording host framework with a manual engine queue
pub struct RecordingHost {
    state: Mutex<HostState>,
    queue: Mutex<VecDeque<PendingTask>>,
    shallow_copies: AtomicUsize,
    frees: AtomicUsize,
    managed_created: AtomicUsize,
    managed_released: Arc<AtomicUsize>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHost {
            state: Mutex::new(HostState {
                next_addr: 0x1000,
                ..HostState::default()
            }),
            queue: Mutex::new(VecDeque::new()),
            shallow_copies: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            managed_created: AtomicUsize::new(0),
            managed_released: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Binding that routes a wrapper to this host
    pub fn binding(self: &Arc<Self>) -> HostBinding {
        HostBinding::Fixed(Arc::clone(self) as Arc<dyn HostFramework>)
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<PendingTask>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate(state: &mut HostState) -> TensorHandle {
        let handle = TensorHandle::from_addr(state.next_addr);
        state.next_addr += 0x10;
        handle
    }

    /// New host tensor living on `ctx`
    pub fn tensor(&self, ctx: Context) -> TensorHandle {
        let mut state = self.state();
        let handle = Self::allocate(&mut state);
        state.contexts.insert(handle, ctx);
        handle
    }

    /// Status returned by every following `push_sync`
    pub fn set_push_status(&self, status: i32) {
        self.state().push_status = status;
    }

    /// Allow `n` more managed-tensor exports, then fail
    pub fn fail_exports_after(&self, n: usize) {
        self.state().export_budget = Some(n);
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.state().pushes.clone()
    }

    /// Original tensor behind a shallow copy
    pub fn original_of(&self, copy: TensorHandle) -> Option<TensorHandle> {
        self.state().copies.get(&copy).copied()
    }

    pub fn freed(&self) -> Vec<TensorHandle> {
        self.state().freed.clone()
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn shallow_copies(&self) -> usize {
        self.shallow_copies.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn live_copies(&self) -> usize {
        self.state().copies.len()
    }

    pub fn managed_created(&self) -> usize {
        self.managed_created.load(Ordering::SeqCst)
    }

    pub fn managed_released(&self) -> usize {
        self.managed_released.load(Ordering::SeqCst)
    }

    /// Run and release the oldest queued task; false if the queue is empty
    pub fn run_next(&self, rctx: &RunContext) -> bool {
        let task = self.queue().pop_front();
        match task {
            Some(task) => {
                let mut rctx = *rctx;
                unsafe {
                    (task.run)((&mut rctx as *mut RunContext).cast(), task.param);
                    (task.deleter)(task.param);
                }
                true
            }
            None => false,
        }
    }

    /// Drain the queue on the calling thread
    pub fn run_all(&self, rctx: &RunContext) -> usize {
        let mut ran = 0;
        while self.run_next(rctx) {
            ran += 1;
        }
        ran
    }

    /// Drain the queue on a separate worker thread
    pub fn run_all_on_thread(self: &Arc<Self>, rctx: RunContext) -> usize {
        let host = Arc::clone(self);
        let rctx = SendRunContext(rctx);
        std::thread::spawn(move || {
            let rctx = rctx;
            host.run_all(&rctx.0)
        })
        .join()
        .unwrap_or(0)
    }

    /// Release queued tasks without running them
    pub fn discard_pending(&self) -> usize {
        let tasks: Vec<PendingTask> = self.queue().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            unsafe { (task.deleter)(task.param) };
        }
        count
    }
}

unsafe extern "C" fn release_managed(this: *mut DLManagedTensor) {
    let managed = Box::from_raw(this);
    let released = Arc::from_raw(managed.manager_ctx as *const AtomicUsize);
    released.fetch_add(1, Ordering::SeqCst);
}

fn dl_context(ctx: Context) -> DLContext {
    match ctx.dev_type {
        DeviceType::Gpu => DLContext::gpu(ctx.dev_id),
        DeviceType::Cpu | DeviceType::CpuPinned => DLContext::cpu(),
    }
}

impl HostFramework for RecordingHost {
    fn shallow_copy(&self, src: TensorHandle) -> BridgeResult<TensorHandle> {
        let mut state = self.state();
        let original = state.copies.get(&src).copied().unwrap_or(src);
        if !state.contexts.contains_key(&original) {
            return Err(BridgeError::HostCallFailed {
                call: "MXShallowCopyNDArray",
                code: -1,
            });
        }
        let copy = Self::allocate(&mut state);
        state.copies.insert(copy, original);
        self.shallow_copies.fetch_add(1, Ordering::SeqCst);
        Ok(copy)
    }

    fn free(&self, handle: TensorHandle) -> BridgeResult<()> {
        let mut state = self.state();
        if state.copies.remove(&handle).is_none() {
            return Err(BridgeError::HostCallFailed {
                call: "MXNDArrayFree",
                code: -1,
            });
        }
        state.freed.push(handle);
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn context(&self, handle: TensorHandle) -> BridgeResult<Context> {
        let state = self.state();
        let original = state.copies.get(&handle).copied().unwrap_or(handle);
        state
            .contexts
            .get(&original)
            .copied()
            .ok_or(BridgeError::HostCallFailed {
                call: "MXNDArrayGetContext",
                code: -1,
            })
    }

    fn to_managed_tensor(&self, handle: TensorHandle) -> BridgeResult<NonNull<DLManagedTensor>> {
        let (original, ctx) = {
            let mut state = self.state();
            if let Some(budget) = state.export_budget.as_mut() {
                if *budget == 0 {
                    return Err(BridgeError::HostCallFailed {
                        call: "MXNDArrayToDLPack",
                        code: -1,
                    });
                }
                *budget -= 1;
            }
            let original = state.copies.get(&handle).copied().unwrap_or(handle);
            let ctx = state.contexts.get(&original).copied().ok_or(
                BridgeError::HostCallFailed {
                    call: "MXNDArrayToDLPack",
                    code: -2,
                },
            )?;
            (original, ctx)
        };

        let managed = Box::new(DLManagedTensor {
            dl_tensor: DLTensor {
                data: original.as_ptr(),
                ctx: dl_context(ctx),
                ndim: 0,
                dtype: DLDataType::float32(),
                shape: std::ptr::null_mut(),
                strides: std::ptr::null_mut(),
                byte_offset: 0,
            },
            manager_ctx: Arc::into_raw(Arc::clone(&self.managed_released)) as *mut c_void,
            deleter: Some(release_managed),
        });
        self.managed_created.fetch_add(1, Ordering::SeqCst);
        Ok(NonNull::from(Box::leak(managed)))
    }

    fn push_sync(&self, task: EngineTask<'_>) -> BridgeResult<()> {
        {
            let mut state = self.state();
            if state.push_status != 0 {
                return Err(BridgeError::EnginePushFailed(state.push_status));
            }
            let ctx = unsafe { *task.ctx };
            state.pushes.push(PushRecord {
                ctx,
                reads: task.const_handles.to_vec(),
                writes: task.mutable_handles.to_vec(),
                priority: task.priority,
                name: task.name.map(|name| name.to_string_lossy().into_owned()),
            });
        }
        self.queue().push_back(PendingTask {
            run: task.run,
            param: task.param,
            deleter: task.deleter,
        });
        Ok(())
    }
}
