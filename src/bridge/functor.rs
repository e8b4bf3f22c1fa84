//! Invocation functor
//!
//! One functor is built per wrapped call. [`InvocationFunctor::init`] runs
//! on the caller's thread: it copies the packed argument buffer, replaces
//! every framework tensor by a shallow copy retagged as a DLPack tensor,
//! resolves the single device context of the call and collects the
//! provisional read/write sets. [`InvocationFunctor::run`] runs later on an
//! engine thread: it exports the copies as managed tensors, patches their
//! `DLTensor*` into the buffer and calls the user function, under the
//! engine's stream for GPU calls.
//!
//! Dropping the functor frees every shallow copy exactly once.

use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::abi::dlpack::DLManagedTensor;
use crate::abi::{type_code, Context, PackedArgs, PackedFunc, PackedRet, PackedValue, RunContext};
use crate::bridge::deps::DependencySets;
use crate::bridge::stream::StreamBinding;
use crate::config::ConstLocPolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostFramework, TensorHandle};
use crate::stats;

/// Marshalled state of one scheduled call
pub struct InvocationFunctor {
    host: Arc<dyn HostFramework>,
    func: PackedFunc,
    set_stream: PackedFunc,
    values: Vec<PackedValue>,
    type_codes: Vec<c_int>,
    /// Shallow copies owned by this functor
    array_handles: Vec<TensorHandle>,
    /// Argument position of each shallow copy
    array_locs: Vec<usize>,
    ctx: Context,
}

// SAFETY: the functor is built on the caller thread and then moved, never
// shared, to one engine thread. Its raw payloads are host handles, which
// host primitives accept from any thread.
unsafe impl Send for InvocationFunctor {}

impl InvocationFunctor {
    /// Marshal `args` for asynchronous execution
    ///
    /// `const_loc` must be sorted ascending. Returns the functor with the
    /// provisional dependency sets; on error every shallow copy made so far
    /// is freed.
    pub fn init(
        host: Arc<dyn HostFramework>,
        func: PackedFunc,
        set_stream: PackedFunc,
        args: PackedArgs<'_>,
        const_loc: &[usize],
        policy: ConstLocPolicy,
    ) -> BridgeResult<(Self, DependencySets)> {
        let mut functor = InvocationFunctor {
            host,
            func,
            set_stream,
            values: args.values().to_vec(),
            type_codes: args.type_codes().to_vec(),
            array_handles: Vec::new(),
            array_locs: Vec::new(),
            ctx: Context::cpu(0),
        };

        if policy == ConstLocPolicy::Strict {
            functor.check_const_loc(const_loc)?;
        }

        let mut deps = DependencySets::new();
        let mut unified: Option<Context> = None;
        let mut cursor = 0;

        for i in 0..functor.values.len() {
            let code = functor.type_codes[i];
            if code != type_code::FRAMEWORK_NDARRAY {
                if !type_code::is_pod(code) {
                    return Err(BridgeError::NonPodArgument {
                        position: i,
                        type_code: code,
                    });
                }
                continue;
            }

            // SAFETY: the slot is tagged as a framework tensor.
            let original = TensorHandle(unsafe { functor.values[i].v_handle });
            let copy = functor.host.shallow_copy(original)?;
            functor.array_handles.push(copy);
            functor.array_locs.push(i);
            stats::global().record_shallow_copy();
            functor.type_codes[i] = type_code::ARRAY_HANDLE;

            // positions skipped here named non-tensor slots (lenient only)
            while cursor < const_loc.len() && const_loc[cursor] < i {
                cursor += 1;
            }
            if cursor < const_loc.len() && const_loc[cursor] == i {
                deps.add_read(original);
                cursor += 1;
            } else {
                deps.add_write(original);
            }

            let ctx = functor.host.context(copy)?;
            match unified {
                None => unified = Some(ctx),
                Some(current) if current != ctx => {
                    return Err(BridgeError::InconsistentContext {
                        current,
                        incoming: ctx,
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(ctx) = unified {
            functor.ctx = ctx;
        }
        tracing::trace!(
            ctx = %functor.ctx,
            tensors = functor.array_handles.len(),
            reads = deps.reads.len(),
            writes = deps.writes.len(),
            "marshalled packed call"
        );
        Ok((functor, deps))
    }

    fn check_const_loc(&self, const_loc: &[usize]) -> BridgeResult<()> {
        for &pos in const_loc {
            match self.type_codes.get(pos) {
                None => {
                    return Err(BridgeError::InvalidConstLocation(format!(
                        "position {} out of range for {} arguments",
                        pos,
                        self.type_codes.len()
                    )))
                }
                Some(&code) if code != type_code::FRAMEWORK_NDARRAY => {
                    return Err(BridgeError::InvalidConstLocation(format!(
                        "position {} holds a {} argument, not a tensor",
                        pos,
                        type_code::name(code)
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Execute the user function on the calling engine thread
    ///
    /// Every managed tensor exported here is released before returning,
    /// whether or not the call succeeds.
    pub fn run(&mut self, rctx: &RunContext) -> BridgeResult<()> {
        let mut managed = ManagedTensors::with_capacity(self.array_handles.len());
        for (&handle, &loc) in self.array_handles.iter().zip(&self.array_locs) {
            let tensor = self.host.to_managed_tensor(handle)?;
            managed.push(tensor);
            // SAFETY: the managed tensor stays alive until `managed` drops.
            let dl_tensor = unsafe { DLManagedTensor::dl_tensor_ptr(tensor.as_ptr()) };
            self.values[loc].v_handle = dl_tensor.cast();
        }

        let args = PackedArgs::new(&self.values, &self.type_codes)?;
        let mut ret = PackedRet::default();
        if self.ctx.is_gpu() {
            let engine_ctx = rctx.context()?;
            // SAFETY: the engine hands GPU tasks a pointer to its stream variable.
            let stream = unsafe { rctx.stream_ptr()? };
            let _binding = StreamBinding::bind(&self.set_stream, engine_ctx.dev_id, stream)?;
            self.func.call_packed(args, &mut ret)
        } else {
            self.func.call_packed(args, &mut ret)
        }
    }

    /// Device context shared by every tensor argument
    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn type_codes(&self) -> &[c_int] {
        &self.type_codes
    }

    pub fn array_locations(&self) -> &[usize] {
        &self.array_locs
    }

    /// Shallow copies held for the duration of the call
    pub fn array_handles(&self) -> &[TensorHandle] {
        &self.array_handles
    }
}

impl Drop for InvocationFunctor {
    fn drop(&mut self) {
        for &handle in &self.array_handles {
            match self.host.free(handle) {
                Ok(()) => stats::global().record_shallow_free(),
                Err(e) => tracing::warn!(?handle, "failed to free shallow copy: {}", e),
            }
        }
    }
}

/// Managed tensors exported for one run
struct ManagedTensors(Vec<NonNull<DLManagedTensor>>);

impl ManagedTensors {
    fn with_capacity(capacity: usize) -> Self {
        ManagedTensors(Vec::with_capacity(capacity))
    }

    fn push(&mut self, tensor: NonNull<DLManagedTensor>) {
        stats::global().record_managed_created();
        self.0.push(tensor);
    }
}

impl Drop for ManagedTensors {
    fn drop(&mut self) {
        for tensor in self.0.drain(..) {
            // SAFETY: each tensor came from `to_managed_tensor` and is released once.
            unsafe { DLManagedTensor::release(tensor.as_ptr()) };
            stats::global().record_managed_released();
        }
    }
}
